// SPDX-FileCopyrightText: 2023 embr <git@liclac.eu>
// SPDX-FileCopyrightText: 2024 Wavelens UG <info@wavelens.io>
//
// SPDX-License-Identifier: EUPL-1.2

//! nix-talk
//! ========
//!
//! A small client for the private worker protocol spoken by a [Nix](https://nixos.org/)
//! daemon, covering the two requests needed to get a derivation built:
//!
//! - registering content (eg. a `.drv` file) with the store, through
//!   [`Store::add_to_store()`];
//! - building an already parsed [`Derivation`], through [`Store::build_derivation()`].
//!
//! To connect to a `nix-daemon`, use [`nix::DaemonStore`] (through the [`Store`] trait).
//!
//! ```no_run
//! use nix_talk::{Store, Progress, ProgressExt, nix::DaemonStore};
//! # async {
//! # let drv = nix_talk::Derivation::default();
//! let mut store = DaemonStore::builder().connect().await?;
//! let path = store
//!     .add_to_store("hello.drv", b"Derive(...)", drv.references())
//!     .result()
//!     .await?;
//! let mut log = Vec::new();
//! let result = store
//!     .build_derivation(&path, &drv)
//!     .forward_logs(&mut log)
//!     .await?
//!     .into_result()?;
//! # Ok::<_, nix_talk::Error>(())
//! # };
//! ```
//!
//! The client speaks Protocol 1.37, and understands the older error and build result
//! layouts of daemons that negotiate down to it.

pub mod nix;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::future::Future;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub type Result<T, E = Error> = std::result::Result<T, E>;

trait ResultExt<T, E> {
    fn with_field(self, f: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T, E> for Result<T, E> {
    fn with_field(self, f: &'static str) -> Result<T> {
        self.map_err(|err| Error::Field(f, Box::new(err.into())))
    }
}

/// Error enum for the library.
#[derive(Debug, Error)]
pub enum Error {
    /// This error was encountered while reading/writing a specific field.
    #[error("`{0}`: {1}")]
    Field(&'static str, #[source] Box<Error>),

    /// The peer didn't answer the handshake with the daemon's magic number.
    #[error("protocol mismatch: expected magic {expected:#x}, got {got:#x}")]
    ProtocolMismatch { expected: u64, got: u64 },
    /// The daemon explicitly refuses to trust this client.
    #[error("daemon reports untrusted client")]
    Untrusted,
    /// A length-prefixed string declared more bytes than we're willing to allocate.
    #[error("frame too large: {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: usize },
    /// An unrecognised stderr marker; the stream can't be resynchronised.
    #[error("unknown stderr frame: {0:#x}")]
    UnknownFrame(u64),
    /// An unrecognised tag in an activity field list.
    #[error("unknown field tag: {0}")]
    UnknownFieldTag(u64),

    /// Error returned from the nix daemon. The connection stays usable.
    #[error("nix daemon error: {0}")]
    DaemonError(String),
    /// A build finished with a failure status. See [`BuildResult::into_result()`].
    #[error("build failed ({status:?}): {msg}")]
    BuildFailed {
        status: BuildResultStatus,
        msg: String,
    },
    /// A previous operation left the connection in an unknown state.
    #[error("connection is unusable after an earlier protocol failure")]
    Poisoned,

    /// IO error.
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

impl Error {
    /// Returns the underlying error, without any [`Error::Field`] wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Self::Field(_, err) => err.root(),
            err => err,
        }
    }

    /// Whether this error leaves the byte stream in an unknown position, after which
    /// no further operations may be attempted on the same connection.
    ///
    /// Daemon-reported failures (an error frame, a failed build) are fully consumed
    /// before they're returned, and don't poison anything.
    pub fn poisons_connection(&self) -> bool {
        !matches!(
            self.root(),
            Self::DaemonError(_) | Self::BuildFailed { .. }
        )
    }
}

/// Real-time logging data returned from a [`Progress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stderr {
    /// Raw output, eg. from a builder. Passed through byte for byte.
    Write(Bytes),
    /// A plain line of stderr output.
    Next(Bytes),
    /// An error propagated from Nix. Only the message survives decoding.
    Error(String),
    /// An activity (such as a build) was started.
    StartActivity(StderrStartActivity),
    /// An activity (such as a build) finished.
    StopActivity { act_id: u64 },
    /// A progress update from an activity.
    Result(StderrResult),
}

impl Stderr {
    /// Returns the log output carried by this message, if any.
    pub fn as_log_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Write(b) | Self::Next(b) => Some(&b[..]),
            _ => None,
        }
    }
}

/// Type of a [`Stderr::StartActivity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum StderrActivityType {
    Unknown = 0,
    CopyPath = 100,
    FileTransfer = 101,
    Realise = 102,
    CopyPaths = 103,
    Builds = 104,
    Build = 105,
    OptimiseStore = 106,
    VerifyPaths = 107,
    Substitute = 108,
    QueryPathInfo = 109,
    PostBuildHook = 110,
    BuildWaiting = 111,
    FetchTree = 112,
}

/// Notification that an Activity (such as a build) has started.
///
/// The numeric codes are kept raw, so that a newer daemon's additions don't break
/// decoding; use the helpers to interpret them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StderrStartActivity {
    /// Activity ID. The same act_id is passed in [`Stderr::StopActivity`] and [`Stderr::Result`].
    pub act_id: u64,
    /// Log level of this activity, see [`Self::verbosity()`].
    pub level: u64,
    /// Type of the activity, see [`Self::activity_type()`].
    pub kind: u64,
    /// Log message.
    pub s: String,
    /// Additional fields. The meaning of these depend on the value of .kind.
    pub fields: Vec<StderrField>,
    /// Parent activity, or 0 if this is the top-level one
    pub parent_id: u64,
}

impl StderrStartActivity {
    pub fn activity_type(&self) -> Option<StderrActivityType> {
        self.kind.try_into().ok()
    }
    pub fn verbosity(&self) -> Option<Verbosity> {
        self.level.try_into().ok()
    }
}

/// Type of a [`StderrResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum StderrResultType {
    FileLinked = 100,
    BuildLogLine = 101,
    UntrustedPath = 102,
    CorruptedPath = 103,
    SetPhase = 104,
    Progress = 105,
    SetExpected = 106,
    PostBuildLogLine = 107,
    FetchStatus = 108,
}

/// Notification that a result of some kind (see [`StderrResultType`]) has been produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StderrResult {
    /// Activity ID. The same act_id is passed in [`Stderr::StartActivity`] and [`Stderr::StopActivity`].
    pub act_id: u64,
    /// Type of the result, see [`Self::result_type()`].
    pub kind: u64,
    /// Additional fields. The meaning of these depend on the value of .kind.
    pub fields: Vec<StderrField>,
}

impl StderrResult {
    pub fn result_type(&self) -> Option<StderrResultType> {
        self.kind.try_into().ok()
    }
}

/// A raw field used in [`StderrStartActivity`] and [`StderrResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StderrField {
    Int(u64),
    String(String),
}

impl StderrField {
    /// If this is a Self::Int, return the value, else None.
    pub fn as_int(&self) -> Option<&u64> {
        if let Self::Int(v) = self {
            Some(v)
        } else {
            None
        }
    }

    /// If this is a Self::String, return the value, else None.
    pub fn as_string(&self) -> Option<&String> {
        if let Self::String(v) = self {
            Some(v)
        } else {
            None
        }
    }
}

/// Verbosity of a log message, or of the daemon's logging as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum Verbosity {
    Error = 0,
    Warn,
    Notice,
    Info,
    Talkative,
    Chatty,
    Debug,
    Vomit,
}

/// Sent along with [`Store::build_derivation()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum BuildMode {
    Normal,
    Repair,
    Check,
}

/// Status code for a [`BuildResult`].
///
/// The set of codes grows with the daemon; anything we don't know about is kept
/// as [`BuildResultStatus::Unknown`] instead of failing the decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum BuildResultStatus {
    Built = 0,
    Substituted = 1,
    AlreadyValid = 2,
    PermanentFailure = 3,
    InputRejected = 4,
    OutputRejected = 5,
    /// "possibly transient", the CppNix source helpfully points out.
    TransientFailure = 6,
    /// No longer used, according to a comment in CppNix 2.19.3.
    CachedFailure = 7,
    TimedOut = 8,
    MiscFailure = 9,
    DependencyFailed = 10,
    LogLimitExceeded = 11,
    NotDeterministic = 12,
    ResolvesToAlreadyValid = 13,
    NoSubstituters = 14,
    #[num_enum(catch_all)]
    Unknown(u64),
}

impl BuildResultStatus {
    /// Built, Substituted and AlreadyValid count as success; every other code,
    /// including unknown ones, is a failure.
    pub fn is_success(&self) -> bool {
        u64::from(*self) <= 2
    }
}

/// Returned from [`Store::build_derivation()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    /// Status code, see BuildResultStatus.
    pub status: BuildResultStatus,
    /// Verbatim error message, or "" if none.
    pub error_msg: String,
    /// How many times this derivation was built. Only present on Proto 1.29+.
    pub times_built: Option<u64>,
    /// Only present on Proto 1.29+.
    pub is_non_deterministic: Option<bool>,
    /// Only present on Proto 1.29+, and None for timestamps that can't be represented.
    pub start_time: Option<DateTime<Utc>>,
    /// Only present on Proto 1.29+, and None for timestamps that can't be represented.
    pub stop_time: Option<DateTime<Utc>>,
}

impl BuildResult {
    /// See [`BuildResultStatus::is_success()`].
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns `Err(Error::BuildFailed)` if the build failed, else the result itself.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::BuildFailed {
                status: self.status,
                msg: self.error_msg,
            })
        }
    }
}

/// One declared output of a [`Derivation`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DerivationOutput {
    /// Store path of the output; may be "" for content-addressed outputs.
    pub path: String,
    /// Hash algorithm, eg. "r:sha256" for fixed-output derivations, else "".
    pub hash_algorithm: String,
    /// Expected hash (base16), or "".
    pub hash: String,
}

/// A parsed build recipe, as produced by a `.drv` parser.
///
/// This crate never parses recipes itself, and never reorders anything in one; the
/// canonical ordering required on the wire is applied while serializing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Derivation {
    /// Name of the derivation, eg. "hello-2.12.1".
    pub name: String,
    /// Map of (output name, output).
    pub outputs: HashMap<String, DerivationOutput>,
    /// Store paths the builder needs to have available.
    pub input_sources: Vec<String>,
    /// Map of (input derivation path, output names used from it).
    pub input_derivations: HashMap<String, BTreeSet<String>>,
    /// Platform the build must run on, eg. "x86_64-linux".
    pub platform: String,
    /// Path to the builder executable.
    pub builder: String,
    /// Arguments to the builder, in order.
    pub args: Vec<String>,
    /// Environment for the builder.
    pub env: HashMap<String, String>,
}

impl Derivation {
    /// Returns the references a `.drv` file for this recipe has, when added to the store
    /// with [`Store::add_to_store()`]: every input derivation, plus every input source.
    pub fn references(&self) -> Vec<String> {
        let mut refs = self
            .input_derivations
            .keys()
            .chain(self.input_sources.iter())
            .cloned()
            .collect::<Vec<_>>();
        refs.sort();
        refs
    }
}

/// Sent as part of the handshake, and with [`Store::set_options()`].
///
/// The defaults are exactly what the handshake sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Whether to keep temporary directories of failed builds.
    ///
    /// Default: `false`
    pub keep_failed: bool,

    /// Whether to keep building derivations when another build fails.
    ///
    /// Default: `false`
    pub keep_going: bool,

    /// Whether to fall back to building from source if a binary substitution fails.
    ///
    /// Default: `false`
    pub try_fallback: bool,

    /// Verbosity.
    ///
    /// Default: [`Verbosity::Error`].
    pub verbosity: Verbosity,

    /// Number of derivations Nix will attempt to build in parallel.
    ///
    /// Default: `1`
    pub max_build_jobs: u64,

    /// Number of seconds a build is allowed to produce no stdout or stderr output.
    ///
    /// Default: `0`
    pub max_silent_time: u64,

    /// Obsolete, but still part of the message.
    ///
    /// Default: `true`
    pub use_build_hook: bool,

    /// Verbosity of build output.
    ///
    /// Default: [`Verbosity::Error`].
    pub build_verbosity: Verbosity,

    /// How many cores will be used for an individual build. 0 = all of them.
    ///
    /// Default: `0`
    pub build_cores: u64,

    /// Whether to use binary substitutes if available.
    ///
    /// Default: `true`
    pub use_substitutes: bool,

    /// Undocumented. Some additional settings can be set using this field.
    ///
    /// Default: empty.
    pub overrides: BTreeMap<String, String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            keep_failed: false,
            keep_going: false,
            try_fallback: false,
            verbosity: Verbosity::Error,
            max_build_jobs: 1,
            max_silent_time: 0,
            use_build_hook: true,
            build_verbosity: Verbosity::Error,
            build_cores: 0,
            use_substitutes: true,
            overrides: BTreeMap::default(),
        }
    }
}

/// PathInfo, like `nix path-info` would return.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathInfo {
    /// The first derivation that produced this path.
    pub deriver: Option<String>,

    /// Other paths referenced by this path.
    pub references: Vec<String>,

    /// NAR hash, in the form: "(algo)-(hash)".
    pub nar_hash: String,
    /// NAR size.
    pub nar_size: u64,

    /// Is this path "ultimately trusted", eg. built locally?
    pub ultimate: bool,
    /// Optional signatures, eg. from a binary cache.
    pub signatures: Vec<String>,
    /// An assertion that this path is content-addressed, eg. for fixed-output derivations.
    pub ca: Option<String>,

    /// When the path was registered, eg. placed into the local store.
    /// None if the daemon sent a timestamp that can't be represented.
    pub registration_time: Option<DateTime<Utc>>,
}

/// An in-progress operation, which may produces a series of [`Stderr`]s before returning.
///
/// All functions on the Store trait return these wrappers. If you just want the final
/// result, call [`Progress::result()`]; to see the build log as it happens, use
/// [`ProgressExt::forward_logs()`]:
///
/// ```no_run
/// use nix_talk::{Store, Progress, ProgressExt, nix::DaemonStore};
/// # async {
/// # let mut store = DaemonStore::builder().connect().await?;
/// # let drv = nix_talk::Derivation::default();
/// let mut log = Vec::new();
/// let result = store
///     .build_derivation("/nix/store/...-hello.drv", &drv)
///     .forward_logs(&mut log)
///     .await?;
/// # Ok::<_, nix_talk::Error>(())
/// # };
/// ```
///
/// Otherwise, if you are interested in the raw progress updates:
///
/// ```no_run
/// use nix_talk::{Store, Progress, nix::DaemonStore};
/// # async {
/// # let mut store = DaemonStore::builder().connect().await?;
/// # let drv = nix_talk::Derivation::default();
/// let mut prog = store.build_derivation("/nix/store/...-hello.drv", &drv);
/// while let Some(stderr) = prog.next().await? {
///     match stderr {
///         _ => todo!(),
///     }
/// }
/// let result = prog.result().await?;
/// # Ok::<_, nix_talk::Error>(())
/// # };
/// ```
pub trait Progress: Send {
    type T: Send;
    type Error: From<Error> + Send + Sync;

    /// Returns the next Stderr message, or None after all have been consumed.
    /// This must behave like a fused iterator - once None is returned, all further calls
    /// must immediately return None, without corrupting the underlying datastream, etc.
    ///
    /// An error frame from the daemon is returned as `Err`, and ends the operation.
    fn next(&mut self) -> impl Future<Output = Result<Option<Stderr>, Self::Error>> + Send;

    /// Discards any further messages from [`Self::next()`] and proceeds.
    fn result(self) -> impl Future<Output = Result<Self::T, Self::Error>> + Send;
}

/// Helper methods for [`Progress`].
pub trait ProgressExt: Progress {
    /// Calls `f()` for each message returned from [`Progress::next()`], then [`Progress::result()`].
    fn inspect_each<F: Fn(Stderr) + Send>(
        self,
        f: F,
    ) -> impl Future<Output = Result<Self::T, Self::Error>> + Send;

    /// Returns a tuple of (stderr, [`Progress::result()`]), where stderr is a `Vec<Stderr>` of all
    /// Stderr returned by [`Progress::next()`].
    fn split(self) -> impl Future<Output = (Vec<Stderr>, Result<Self::T, Self::Error>)> + Send;

    /// Writes the bytes of every [`Stderr::Write`] and [`Stderr::Next`] to `sink`, discards
    /// all other messages, then returns [`Progress::result()`].
    fn forward_logs<W: AsyncWrite + Unpin + Send>(
        self,
        sink: &mut W,
    ) -> impl Future<Output = Result<Self::T, Self::Error>> + Send;
}
impl<P: Progress> ProgressExt for P {
    async fn inspect_each<F: Fn(Stderr) + Send>(mut self, f: F) -> Result<Self::T, Self::Error> {
        while let Some(stderr) = self.next().await? {
            f(stderr)
        }
        self.result().await
    }

    async fn split(mut self) -> (Vec<Stderr>, Result<Self::T, Self::Error>) {
        let mut stderrs = Vec::new();
        loop {
            match self.next().await {
                Ok(Some(stderr)) => stderrs.push(stderr),
                Err(err) => break (stderrs, Err(err)),
                Ok(None) => break (stderrs, self.result().await),
            }
        }
    }

    async fn forward_logs<W: AsyncWrite + Unpin + Send>(
        mut self,
        sink: &mut W,
    ) -> Result<Self::T, Self::Error> {
        while let Some(stderr) = self.next().await? {
            if let Some(b) = stderr.as_log_bytes() {
                sink.write_all(b).await.map_err(Error::from)?;
            }
        }
        sink.flush().await.map_err(Error::from)?;
        self.result().await
    }
}

/// Generic interface to a Nix store.
///
/// See [`nix::DaemonStore`] for an implementation that talks to a CppNix (compatible) daemon.
pub trait Store {
    type Error: From<Error> + Send + Sync;

    /// Applies client options. This changes the behaviour of future commands.
    fn set_options(&mut self, opts: ClientSettings) -> impl Progress<T = (), Error = Self::Error>;

    /// Adds `content` to the store as a text file named `name`, which may reference the
    /// store paths in `refs`. Returns the resulting store path.
    fn add_to_store<SN, C, Refs>(
        &mut self,
        name: SN,
        content: C,
        refs: Refs,
    ) -> impl Progress<T = String, Error = Self::Error>
    where
        SN: AsRef<str> + Send + Sync + Debug,
        C: AsRef<[u8]> + Send + Sync + Debug,
        Refs: IntoIterator + Send + Debug,
        Refs::Item: AsRef<str> + Send + Sync;

    /// Builds `drv`, which must already be registered in the store as `drv_path`.
    ///
    /// The operation always returns the full [`BuildResult`]; whether it counts as a
    /// success is up to the caller, see [`BuildResult::is_success()`].
    fn build_derivation<P: AsRef<str> + Send + Sync + Debug>(
        &mut self,
        drv_path: P,
        drv: &Derivation,
    ) -> impl Progress<T = BuildResult, Error = Self::Error>;
}
