// SPDX-FileCopyrightText: 2024 embr <git@liclac.eu>
// SPDX-FileCopyrightText: 2024 Wavelens UG <info@wavelens.io>
//
// SPDX-License-Identifier: EUPL-1.2

//! Interfaces to nix-daemon (or compatible) Stores.
//! ------------------------------------------------
//!
//! This module implements the client side of Protocol 1.37. Older daemons are not
//! rejected: the negotiated version is the lower of the two, and the few version-gated
//! frames we read (errors, build results) are decoded according to it.

pub mod wire;

use crate::{
    BuildMode, BuildResult, ClientSettings, Derivation, Error, Progress, Result, ResultExt,
    Stderr, Store,
};
use std::fmt::Debug;
use std::future::Future;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};
use tracing::{debug, info, instrument, warn};

/// Where nix-daemon listens by default.
pub const DEFAULT_SOCKET_PATH: &str = "/nix/var/nix/daemon-socket/socket";

/// Protocol version we speak.
///
/// Protocol 1.37 is current as of Nix 2.20:
/// https://github.com/NixOS/nix/blob/2.20.0/src/libstore/worker-protocol.hh#L12
pub const CLIENT_PROTO: Proto = Proto(1, 37);

/// Content-addressing method used for [`Store::add_to_store()`]: a flat text file.
const TEXT_SHA256: &str = "text:sha256";

/// Protocol version, packed on the wire as `(major << 8) | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Proto(pub u8, pub u8);

impl From<u64> for Proto {
    fn from(raw: u64) -> Self {
        Self(((raw & 0xFF00) >> 8) as u8, (raw & 0x00FF) as u8)
    }
}
impl From<Proto> for u64 {
    fn from(v: Proto) -> Self {
        ((v.0 as u64) << 8) | (v.1 as u64)
    }
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

impl Proto {
    /// Whether this is at least protocol 1.`v`.
    fn since(&self, v: u8) -> bool {
        *self >= Proto(1, v)
    }
}

/// Whether a [`DaemonStore`] can take another operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Idle, and aligned with the daemon.
    Ready,
    /// A request has been sent, and its response not yet fully read.
    InFlight,
    /// The stream is in an unknown position. Every further operation fails.
    Poisoned,
}

trait DaemonProgressCaller {
    fn call<
        E: From<Error> + From<std::io::Error> + Send + Sync,
        C: AsyncReadExt + AsyncWriteExt + Unpin + Send,
    >(
        self,
        store: &mut DaemonStore<C>,
    ) -> impl Future<Output = Result<(), E>> + Send;
}

trait DaemonProgressReturner {
    type T: Send;
    fn result<
        E: From<Error> + From<std::io::Error> + Send + Sync,
        C: AsyncReadExt + AsyncWriteExt + Unpin + Send,
    >(
        self,
        store: &mut DaemonStore<C>,
    ) -> impl Future<Output = Result<Self::T, E>> + Send;
}

/// Internal [`crate::Progress`] implementation used by [`DaemonStore`].
///
/// The request is only written on the first call to `next()` (or `result()`), so a
/// Progress that's dropped untouched leaves the connection as it was. One that's
/// dropped halfway leaves it [`ConnState::InFlight`], which poisons the next operation.
struct DaemonProgress<'s, PC, PR, T: Send, C>
where
    C: AsyncReadExt + AsyncWriteExt + Unpin + Send,
    PC: DaemonProgressCaller + Send,
    PR: DaemonProgressReturner<T = T> + Send,
{
    store: &'s mut DaemonStore<C>,
    fuse: bool,
    caller: Option<PC>,
    returner: PR,
    daemon_error: Option<String>,
}
impl<'s, PC, PR, T: Send, C> DaemonProgress<'s, PC, PR, T, C>
where
    C: AsyncReadExt + AsyncWriteExt + Unpin + Send,
    PC: DaemonProgressCaller + Send,
    PR: DaemonProgressReturner<T = T> + Send,
{
    fn new(store: &'s mut DaemonStore<C>, caller: PC, returner: PR) -> Self {
        Self {
            store,
            fuse: false,
            caller: Some(caller),
            returner,
            daemon_error: None,
        }
    }
}
impl<'s, PC, PR, T: Send, C> Progress for DaemonProgress<'s, PC, PR, T, C>
where
    C: AsyncReadExt + AsyncWriteExt + Unpin + Send,
    PC: DaemonProgressCaller + Send,
    PR: DaemonProgressReturner<T = T> + Send,
{
    type T = T;
    type Error = Error;

    async fn next(&mut self) -> Result<Option<Stderr>> {
        if let Some(caller) = self.caller.take() {
            self.store.begin()?;
            let store = &mut *self.store;
            let res = async {
                caller.call::<Error, C>(&mut *store).await?;
                store.conn.flush().await?;
                Ok::<_, Error>(())
            }
            .await;
            self.store.settle(res)?;
        }
        if let Some(msg) = &self.daemon_error {
            return Err(Error::DaemonError(msg.clone()));
        }
        if self.fuse {
            return Ok(None);
        }
        if self.store.state != ConnState::InFlight {
            return Err(Error::Poisoned);
        }

        let proto = self.store.proto;
        let res = wire::read_stderr(&mut self.store.conn, proto).await;
        match self.store.settle(res)? {
            Some(Stderr::Error(msg)) => {
                // The error frame is the last thing the daemon sends for this operation.
                self.store.state = ConnState::Ready;
                self.daemon_error = Some(msg.clone());
                Err(Error::DaemonError(msg))
            }
            Some(stderr) => Ok(Some(stderr)),
            None => {
                self.fuse = true;
                Ok(None)
            }
        }
    }

    async fn result(mut self) -> Result<Self::T> {
        while self.next().await?.is_some() {}
        if self.store.state != ConnState::InFlight {
            return Err(Error::Poisoned);
        }
        let res = self.returner.result::<Error, C>(&mut *self.store).await;
        let value = self.store.settle(res)?;
        self.store.state = ConnState::Ready;
        Ok(value)
    }
}

#[derive(Debug, Default)]
pub struct DaemonStoreBuilder {
    settings: ClientSettings,
}

impl DaemonStoreBuilder {
    /// Options sent to the daemon at the end of the handshake. Defaults to
    /// [`ClientSettings::default()`].
    pub fn settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Initializes a [`DaemonStore`] by adopting a connection.
    ///
    /// It's up to the caller that the connection is in a state to begin a nix handshake, eg.
    /// it behaves like a fresh connection to the daemon socket - if this is a connection through
    /// a proxy, any proxy handshakes should already have taken place, etc.
    ///
    /// ```no_run
    /// use tokio::net::UnixStream;
    /// use nix_talk::nix::DaemonStore;
    ///
    /// # async {
    /// let conn = UnixStream::connect("/nix/var/nix/daemon-socket/socket").await?;
    /// let store = DaemonStore::builder().init(conn).await?;
    /// # Ok::<_, nix_talk::Error>(())
    /// # };
    /// ```
    pub async fn init<C: AsyncReadExt + AsyncWriteExt + Unpin + Send>(
        self,
        conn: C,
    ) -> Result<DaemonStore<C>> {
        let mut store = DaemonStore {
            conn,
            proto: Proto(0, 0),
            state: ConnState::Ready,
        };
        store.handshake(self.settings).await?;
        Ok(store)
    }

    /// Connects to a Nix daemon via a unix socket.
    /// The path is usually `/nix/var/nix/daemon-socket/socket`.
    ///
    /// ```no_run
    /// use nix_talk::{Store, Progress, nix::DaemonStore};
    ///
    /// # async {
    /// let store = DaemonStore::builder()
    ///     .connect_unix("/nix/var/nix/daemon-socket/socket")
    ///     .await?;
    /// # Ok::<_, nix_talk::Error>(())
    /// # };
    /// ```
    pub async fn connect_unix<P: AsRef<std::path::Path>>(
        self,
        path: P,
    ) -> Result<DaemonStore<UnixStream>> {
        self.init(UnixStream::connect(path).await?).await
    }

    /// Connects to the Nix daemon at [`DEFAULT_SOCKET_PATH`].
    pub async fn connect(self) -> Result<DaemonStore<UnixStream>> {
        self.connect_unix(DEFAULT_SOCKET_PATH).await
    }
}

/// Store backed by a `nix-daemon` (or compatible store). Implements [`crate::Store`].
///
/// ```no_run
/// use nix_talk::{Store, Progress, nix::DaemonStore};
///
/// # async {
/// let mut store = DaemonStore::builder().connect().await?;
///
/// let path = store
///     .add_to_store("greeting", "hello", Vec::<String>::new())
///     .result()
///     .await?;
/// # Ok::<_, nix_talk::Error>(())
/// # };
/// ```
#[derive(Debug)]
pub struct DaemonStore<C: AsyncReadExt + AsyncWriteExt + Unpin> {
    conn: C,
    proto: Proto,
    state: ConnState,
}

impl DaemonStore<UnixStream> {
    /// Returns a Builder.
    pub fn builder() -> DaemonStoreBuilder {
        DaemonStoreBuilder::default()
    }
}

impl<C: AsyncReadExt + AsyncWriteExt + Unpin> DaemonStore<C> {
    /// Negotiated protocol version.
    pub fn proto(&self) -> Proto {
        self.proto
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Shuts down the connection. Anything still in flight is abandoned.
    pub async fn close(mut self) -> Result<()> {
        Ok(self.conn.shutdown().await?)
    }

    fn begin(&mut self) -> Result<()> {
        match self.state {
            ConnState::Ready => {
                self.state = ConnState::InFlight;
                Ok(())
            }
            ConnState::InFlight => {
                warn!("Previous operation was abandoned mid-response");
                self.state = ConnState::Poisoned;
                Err(Error::Poisoned)
            }
            ConnState::Poisoned => Err(Error::Poisoned),
        }
    }

    /// Records the effect of a failed step on the connection.
    fn settle<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(err) = &res {
            if err.poisons_connection() {
                warn!(%err, "Connection poisoned");
                self.state = ConnState::Poisoned;
            } else {
                self.state = ConnState::Ready;
            }
        }
        res
    }

    #[instrument(skip(self, settings))]
    async fn handshake(&mut self, settings: ClientSettings) -> Result<()>
    where
        C: Send,
    {
        // Exchange magic numbers.
        wire::write_u64(&mut self.conn, wire::WORKER_MAGIC_1)
            .await
            .with_field("magic1")?;
        self.conn.flush().await?;
        let magic2 = wire::read_u64(&mut self.conn).await.with_field("magic2")?;
        if magic2 != wire::WORKER_MAGIC_2 {
            return Err(Error::ProtocolMismatch {
                expected: wire::WORKER_MAGIC_2,
                got: magic2,
            });
        }

        // Exchange versions; decode everything after this according to the lower one.
        let daemon_proto = wire::read_proto(&mut self.conn)
            .await
            .with_field("daemon_proto")?;
        self.proto = daemon_proto.min(CLIENT_PROTO);
        wire::write_proto(&mut self.conn, CLIENT_PROTO)
            .await
            .with_field("client_proto")?;

        // Write some obsolete fields.
        wire::write_u64(&mut self.conn, 0)
            .await
            .with_field("__obsolete_cpu_affinity")?;
        wire::write_bool(&mut self.conn, false)
            .await
            .with_field("__obsolete_reserve_space")?;
        self.conn.flush().await?;

        let nix_version = wire::read_string(&mut self.conn, wire::MAX_STRING_LEN)
            .await
            .with_field("nix_version")?;
        // 0 = unknown, 1 = trusted, 2 = not trusted.
        let trust = wire::read_u64(&mut self.conn)
            .await
            .with_field("remote_trust")?;
        if trust == wire::TRUST_NOT_TRUSTED {
            return Err(Error::Untrusted);
        }
        info!(
            %daemon_proto,
            proto = %self.proto,
            nix_version = nix_version.as_str(),
            trust,
            "Connected"
        );

        // Discard Stderr. There shouldn't be anything here anyway.
        wire::drain_stderr(&mut self.conn, self.proto, None::<&mut Vec<u8>>).await?;

        self.set_options(settings).result().await
    }
}

impl<C: AsyncReadExt + AsyncWriteExt + Unpin + Send> Store for DaemonStore<C> {
    type Error = Error;

    #[instrument(skip(self))]
    fn set_options(&mut self, opts: ClientSettings) -> impl Progress<T = (), Error = Self::Error> {
        struct Caller {
            opts: ClientSettings,
        }
        impl DaemonProgressCaller for Caller {
            async fn call<
                E: From<Error> + From<std::io::Error> + Send + Sync,
                C: AsyncReadExt + AsyncWriteExt + Unpin + Send,
            >(
                self,
                store: &mut DaemonStore<C>,
            ) -> Result<(), E> {
                wire::write_op(&mut store.conn, wire::Op::SetOptions)
                    .await
                    .with_field("SetOptions.<op>")?;
                wire::write_client_settings(&mut store.conn, &self.opts)
                    .await
                    .with_field("SetOptions.clientSettings")?;
                Ok(())
            }
        }

        struct Returner;
        impl DaemonProgressReturner for Returner {
            type T = ();
            async fn result<
                E: From<Error> + From<std::io::Error> + Send + Sync,
                C: AsyncReadExt + AsyncWriteExt + Unpin + Send,
            >(
                self,
                _store: &mut DaemonStore<C>,
            ) -> Result<Self::T, E> {
                Ok(())
            }
        }

        DaemonProgress::new(self, Caller { opts }, Returner)
    }

    #[instrument(skip(self, content))]
    fn add_to_store<SN, C2, Refs>(
        &mut self,
        name: SN,
        content: C2,
        refs: Refs,
    ) -> impl Progress<T = String, Error = Self::Error>
    where
        SN: AsRef<str> + Send + Sync + Debug,
        C2: AsRef<[u8]> + Send + Sync + Debug,
        Refs: IntoIterator + Send + Debug,
        Refs::Item: AsRef<str> + Send + Sync,
    {
        struct Caller<SN, C2, Refs>
        where
            SN: AsRef<str> + Send + Sync + Debug,
            C2: AsRef<[u8]> + Send + Sync + Debug,
            Refs: IntoIterator + Send + Debug,
            Refs::Item: AsRef<str> + Send + Sync,
        {
            name: SN,
            content: C2,
            refs: Refs,
        }
        impl<SN, C2, Refs> DaemonProgressCaller for Caller<SN, C2, Refs>
        where
            SN: AsRef<str> + Send + Sync + Debug,
            C2: AsRef<[u8]> + Send + Sync + Debug,
            Refs: IntoIterator + Send + Debug,
            Refs::Item: AsRef<str> + Send + Sync,
        {
            async fn call<
                E: From<Error> + From<std::io::Error> + Send + Sync,
                C: AsyncReadExt + AsyncWriteExt + Unpin + Send,
            >(
                self,
                store: &mut DaemonStore<C>,
            ) -> Result<(), E> {
                wire::write_op(&mut store.conn, wire::Op::AddToStore)
                    .await
                    .with_field("AddToStore.<op>")?;
                wire::write_string(&mut store.conn, &self.name)
                    .await
                    .with_field("AddToStore.name")?;
                wire::write_string(&mut store.conn, TEXT_SHA256)
                    .await
                    .with_field("AddToStore.camStr")?;
                wire::write_string_set(&mut store.conn, self.refs)
                    .await
                    .with_field("AddToStore.refs")?;
                wire::write_bool(&mut store.conn, false)
                    .await
                    .with_field("AddToStore.repair")?;
                wire::write_framed(&mut store.conn, self.content.as_ref())
                    .await
                    .with_field("AddToStore.<source>")?;
                Ok(())
            }
        }

        struct Returner;
        impl DaemonProgressReturner for Returner {
            type T = String;
            async fn result<
                E: From<Error> + From<std::io::Error> + Send + Sync,
                C: AsyncReadExt + AsyncWriteExt + Unpin + Send,
            >(
                self,
                store: &mut DaemonStore<C>,
            ) -> Result<Self::T, E> {
                let path = wire::read_valid_path_info(&mut store.conn, store.proto)
                    .await
                    .with_field("AddToStore.<result>")?;
                debug!(path = path.as_str(), "Added");
                Ok(path)
            }
        }

        DaemonProgress::new(
            self,
            Caller {
                name,
                content,
                refs,
            },
            Returner,
        )
    }

    #[instrument(skip(self, drv), fields(drv.name = drv.name.as_str()))]
    fn build_derivation<P: AsRef<str> + Send + Sync + Debug>(
        &mut self,
        drv_path: P,
        drv: &Derivation,
    ) -> impl Progress<T = BuildResult, Error = Self::Error> {
        struct Caller<'d, P: AsRef<str> + Send + Sync + Debug> {
            drv_path: P,
            drv: &'d Derivation,
        }
        impl<'d, P: AsRef<str> + Send + Sync + Debug> DaemonProgressCaller for Caller<'d, P> {
            async fn call<
                E: From<Error> + From<std::io::Error> + Send + Sync,
                C: AsyncReadExt + AsyncWriteExt + Unpin + Send,
            >(
                self,
                store: &mut DaemonStore<C>,
            ) -> Result<(), E> {
                wire::write_op(&mut store.conn, wire::Op::BuildDerivation)
                    .await
                    .with_field("BuildDerivation.<op>")?;
                wire::write_string(&mut store.conn, &self.drv_path)
                    .await
                    .with_field("BuildDerivation.drv_path")?;
                wire::write_derivation(&mut store.conn, self.drv)
                    .await
                    .with_field("BuildDerivation.drv")?;
                wire::write_build_mode(&mut store.conn, BuildMode::Normal)
                    .await
                    .with_field("BuildDerivation.build_mode")?;
                Ok(())
            }
        }

        struct Returner;
        impl DaemonProgressReturner for Returner {
            type T = BuildResult;
            async fn result<
                E: From<Error> + From<std::io::Error> + Send + Sync,
                C: AsyncReadExt + AsyncWriteExt + Unpin + Send,
            >(
                self,
                store: &mut DaemonStore<C>,
            ) -> Result<Self::T, E> {
                let br = wire::read_build_result(&mut store.conn, store.proto)
                    .await
                    .with_field("BuildDerivation.<result>")?;
                debug!(status = ?br.status, "Built");
                Ok(br)
            }
        }

        DaemonProgress::new(self, Caller { drv_path, drv }, Returner)
    }
}
