// SPDX-FileCopyrightText: 2023 embr <git@liclac.eu>
// SPDX-FileCopyrightText: 2024 Wavelens UG <info@wavelens.io>
//
// SPDX-License-Identifier: EUPL-1.2

//! Low-level helpers for the nix-daemon wire format.
//!
//! Everything is a little-endian u64, or built out of them: strings are a u64 length
//! followed by the data, zero-padded to the next 8-byte boundary. Reads are bounded, so
//! a corrupted length can't make us allocate the world.

use crate::{
    nix::Proto, BuildMode, BuildResult, BuildResultStatus, ClientSettings, Derivation, Error,
    PathInfo, Result, ResultExt, Stderr, StderrField, StderrResult, StderrStartActivity,
    Verbosity,
};
use async_stream::try_stream;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::OptionFuture;
use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};
use std::collections::BTreeMap;
use std::fmt::Debug;
use tap::{Tap, TapFallible};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, instrument, trace, warn};

/// Magic number sent by the client.
pub const WORKER_MAGIC_1: u64 = 0x6e697863;
/// Magic number sent by the daemon.
pub const WORKER_MAGIC_2: u64 = 0x6478696f;

/// Upper bound for ordinary strings.
pub const MAX_STRING_LEN: usize = 64 * 1024;
/// Upper bound for error messages and error traces.
pub const MAX_ERROR_LEN: usize = 256 * 1024;

/// Trust status the daemon sends during the handshake: 0 = unknown, 1 = trusted.
pub const TRUST_NOT_TRUSTED: u64 = 2;

/// Opcodes.
#[derive(Debug, Clone, Copy, IntoPrimitive)]
#[repr(u64)]
pub enum Op {
    AddToStore = 7,
    SetOptions = 19,
    BuildDerivation = 36,
}

/// Writes `data` as a FramedSource: a single frame, then the empty frame that ends
/// the stream. Empty data is just the terminator, since an empty frame would end it.
#[instrument(skip_all, level = "trace")]
pub async fn write_framed<W: AsyncWriteExt + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    if !data.is_empty() {
        write_u64(w, data.len() as u64).await?;
        w.write_all(data).await?;
        trace!(len = data.len(), "Copied frame...");
    }
    write_u64(w, 0).await?;
    trace!("Done");
    Ok(())
}

/// Read a u64 from the stream (little endian).
#[instrument(skip(r), level = "trace")]
pub async fn read_u64<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<u64> {
    r.read_u64_le().await.tap_ok(|v| trace!(v, "<-"))
}
/// Write a u64 from the stream (little endian).
#[instrument(skip(w, v), level = "trace")]
pub async fn write_u64<W: AsyncWriteExt + Unpin>(w: &mut W, v: u64) -> std::io::Result<()> {
    w.write_u64_le(v.tap(|v| trace!(v, "->"))).await
}

/// Read a boolean from the stream, encoded as u64 (>0 is true).
#[instrument(skip(r), level = "trace")]
pub async fn read_bool<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<bool> {
    read_u64(r)
        .await
        .map(|v| v > 0)
        .tap_ok(|v| trace!(v, "<-"))
}
/// Write a boolean to the stream, encoded as u64 (0 or 1).
#[instrument(skip(w, v), level = "trace")]
pub async fn write_bool<W: AsyncWriteExt + Unpin>(w: &mut W, v: bool) -> std::io::Result<()> {
    write_u64(w, if v { 1 } else { 0 }.tap(|v| trace!(v, "->"))).await
}

/// Read a DateTime (CppNix: time_t) from the stream, encoded as a unix timestamp.
///
/// Timestamps chrono can't represent (eg. a time_t of -1) are None; the field is
/// consumed either way.
#[instrument(skip(r), level = "trace")]
pub async fn read_datetime<R: AsyncReadExt + Unpin>(
    r: &mut R,
) -> std::io::Result<Option<DateTime<Utc>>> {
    read_u64(r).await.map(|ts| {
        i64::try_from(ts)
            .ok()
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .tap(|dt| trace!(ts, ?dt, "<-"))
    })
}

/// Read a protocol version from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn read_proto<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Proto> {
    Ok(read_u64(r)
        .await
        .map(Proto::from)
        .tap_ok(|v| trace!(?v, "<-"))?)
}
/// Write a protocol version to the stream.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_proto<W: AsyncWriteExt + Unpin>(w: &mut W, v: Proto) -> Result<()> {
    Ok(write_u64(w, v.tap(|v| trace!(?v, "->")).into()).await?)
}

/// Write an opcode to the stream.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_op<W: AsyncWriteExt + Unpin>(w: &mut W, v: Op) -> Result<()> {
    Ok(write_u64(w, v.tap(|v| trace!(?v, "->")).into()).await?)
}

/// Write a verbosity level to the stream.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_verbosity<W: AsyncWriteExt + Unpin>(w: &mut W, v: Verbosity) -> Result<()> {
    Ok(write_u64(w, v.tap(|v| trace!(?v, "->")).into()).await?)
}

/// Write a build mode to the stream.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_build_mode<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    v: BuildMode,
) -> std::io::Result<()> {
    write_u64(w, v.tap(|v| trace!(?v, "->")).into()).await
}

/// Read a build result status from the stream. Unknown codes are kept, not rejected.
#[instrument(skip(r), level = "trace")]
pub async fn read_build_result_status<R: AsyncReadExt + Unpin>(
    r: &mut R,
) -> std::io::Result<BuildResultStatus> {
    read_u64(r)
        .await
        .map(BuildResultStatus::from)
        .tap_ok(|v| trace!(?v, "<-"))
}

/// Read a byte string from the stream. Byte strings are prefixed with a u64 length, but
/// the data is padded to the next 8-byte boundary, eg. a 1-byte string becomes 16 bytes
/// on the wire: 8 for the length, 1 for the data, then 7 bytes of discarded 0x00s.
///
/// Fails with [`Error::FrameTooLarge`] without reading past the length if it's over `max`.
#[instrument(skip(r), level = "trace")]
pub async fn read_bytes<R: AsyncReadExt + Unpin>(r: &mut R, max: usize) -> Result<Bytes> {
    let len = read_u64(r).await?;
    if len > max as u64 {
        return Err(Error::FrameTooLarge { len, max });
    }
    let len = len as usize;
    let padded_len = len + if len % 8 > 0 { 8 - (len % 8) } else { 0 };
    let mut buf = vec![0u8; padded_len];
    r.read_exact(&mut buf).await?;
    buf.truncate(len);
    trace!(len, "<-");
    Ok(Bytes::from(buf))
}

/// Read a string from the stream. See: read_bytes().
///
/// Anything that isn't valid UTF-8 is replaced; use read_bytes() where the exact
/// bytes matter.
#[instrument(skip(r), level = "trace")]
pub async fn read_string<R: AsyncReadExt + Unpin>(r: &mut R, max: usize) -> Result<String> {
    let b = read_bytes(r, max).await?;
    let s = String::from_utf8_lossy(&b).into_owned();
    trace!(v = s.as_str(), "<-");
    Ok(s)
}

/// Write a string to the stream. See: read_string().
#[instrument(skip(w, s), level = "trace")]
pub async fn write_string<W: AsyncWriteExt + Unpin, S: AsRef<str> + Debug>(
    w: &mut W,
    s: S,
) -> std::io::Result<()> {
    trace!(v=?s,"->");
    write_bytes(w, s.as_ref().as_bytes()).await
}

/// Write a byte string to the stream. See: read_bytes().
#[instrument(skip(w, b), level = "trace")]
pub async fn write_bytes<W: AsyncWriteExt + Unpin>(w: &mut W, b: &[u8]) -> std::io::Result<()> {
    write_u64(w, b.len() as u64).await?;
    if !b.is_empty() {
        w.write_all(b).await?;
        if b.len() % 8 > 0 {
            let pad_buf = [0u8; 7];
            let pad_len = 8 - (b.len() % 8);
            w.write_all(&pad_buf[..pad_len]).await?;
            trace!(pad_len, "[ padding ]");
        }
    }
    Ok(())
}

/// Read a list (or set) of strings from the stream - a u64 count, followed by that
/// many strings using the normal `read_string()` encoding.
#[instrument(skip(r), level = "trace")]
pub fn read_strings<R: AsyncReadExt + Unpin>(
    r: &mut R,
    max: usize,
) -> impl Stream<Item = Result<String>> + '_ {
    try_stream! {
        let count = read_u64(r).await.with_field("<count>")? as usize;
        for _ in 0..count {
            yield read_string(r, max).await?;
        }
    }
}
/// Write a list of strings to the stream, in the order given.
#[instrument(skip(w, si), level = "trace")]
pub async fn write_strings<W: AsyncWriteExt + Unpin, I>(w: &mut W, si: I) -> std::io::Result<()>
where
    I: IntoIterator + Send,
    I::IntoIter: ExactSizeIterator + Send,
    I::Item: AsRef<str> + Send + Sync,
{
    let si = si.into_iter();
    write_u64(w, si.len() as u64).await?;
    for s in si {
        write_string(w, s.as_ref()).await?;
    }
    Ok(())
}
/// Write a set of strings to the stream: like `write_strings()`, but sorted first.
/// Duplicates are passed through as-is.
#[instrument(skip(w, si), level = "trace")]
pub async fn write_string_set<W: AsyncWriteExt + Unpin, I>(
    w: &mut W,
    si: I,
) -> std::io::Result<()>
where
    I: IntoIterator,
    I::Item: AsRef<str> + Send + Sync,
{
    let mut sorted = si.into_iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));
    write_strings(w, sorted).await
}

/// Read an error frame's payload from the stream, returning only the message.
///
/// Protocol 1.26 introduced structured errors; older daemons send a message and an
/// exit status. Everything but the message is read just to stay aligned.
#[instrument(skip(r), level = "trace")]
pub async fn read_error<R: AsyncReadExt + Unpin>(r: &mut R, proto: Proto) -> Result<String> {
    if proto < Proto(1, 26) {
        let msg = read_string(r, MAX_STRING_LEN)
            .await
            .with_field("Error.msg")?;
        let exit_status = read_u64(r).await.with_field("Error.exit_status")?;
        debug!(exit_status, msg = msg.as_str(), "<- Error");
        return Ok(msg);
    }

    let kind = read_string(r, MAX_STRING_LEN)
        .await
        .with_field("Error.type")?;
    let level = read_u64(r).await.with_field("Error.level")?;
    let name = read_string(r, MAX_STRING_LEN)
        .await
        .with_field("Error.name")?;
    let msg = read_string(r, MAX_ERROR_LEN)
        .await
        .with_field("Error.msg")?;
    if read_bool(r).await.with_field("Error.have_pos")? {
        warn!("Daemon sent an error position, which it never used to");
    }

    let num_traces = read_u64(r).await.with_field("Error.traces[].<count>")?;
    for _ in 0..num_traces {
        read_bool(r).await.with_field("Error.traces[].have_pos")?;
        let hint = read_string(r, MAX_ERROR_LEN)
            .await
            .with_field("Error.traces[].hint")?;
        trace!(hint = hint.as_str(), "Error.traces[]");
    }

    debug!(
        kind = kind.as_str(),
        level,
        name = name.as_str(),
        msg = msg.as_str(),
        "<- Error"
    );
    Ok(msg)
}

#[instrument(skip(r), level = "trace")]
pub async fn read_build_result<R: AsyncReadExt + Unpin>(
    r: &mut R,
    proto: Proto,
) -> Result<BuildResult> {
    let status = read_build_result_status(r)
        .await
        .with_field("BuildResult.status")?;
    let error_msg = read_string(r, MAX_ERROR_LEN)
        .await
        .with_field("BuildResult.error_msg")?;

    let mut br = BuildResult {
        status,
        error_msg,
        times_built: None,
        is_non_deterministic: None,
        start_time: None,
        stop_time: None,
    };

    if proto >= Proto(1, 29) {
        br.times_built = Some(read_u64(r).await.with_field("BuildResult.times_built")?);
        br.is_non_deterministic = Some(
            read_bool(r)
                .await
                .with_field("BuildResult.is_non_deterministic")?,
        );
        br.start_time = read_datetime(r)
            .await
            .with_field("BuildResult.start_time")?;
        br.stop_time = read_datetime(r).await.with_field("BuildResult.stop_time")?;
    }

    Ok(br)
}

#[derive(Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum StderrKind {
    Write = 0x64617416,
    Next = 0x6f6c6d67,
    Last = 0x616c7473,
    Error = 0x63787470,
    StartActivity = 0x53545254,
    StopActivity = 0x53544f50,
    Result = 0x52534c54,
}

/// Read one stderr message from the stream. Returns None for the terminating `Last`.
///
/// An error frame is decoded into [`Stderr::Error`]; it's up to the caller to treat it
/// as the end of the operation. An unknown marker leaves the stream unusable.
#[instrument(skip(r), level = "trace")]
pub async fn read_stderr<R: AsyncReadExt + Unpin>(r: &mut R, proto: Proto) -> Result<Option<Stderr>> {
    let kind = StderrKind::try_from(read_u64(r).await.with_field("Stderr.<kind>")?)
        .map_err(|TryFromPrimitiveError { number }| Error::UnknownFrame(number))?
        .tap(|kind| trace!(?kind, "<-"));

    match kind {
        StderrKind::Last => Ok(None),
        StderrKind::Write => Ok(Some(Stderr::Write(
            read_bytes(r, MAX_STRING_LEN)
                .await
                .with_field("Stderr.Write")?,
        ))),
        StderrKind::Next => Ok(Some(Stderr::Next(
            read_bytes(r, MAX_STRING_LEN)
                .await
                .with_field("Stderr.Next")?,
        ))),
        StderrKind::Error => Ok(Some(Stderr::Error(read_error(r, proto).await?))),
        StderrKind::StartActivity => Ok(Some(Stderr::StartActivity(
            read_stderr_start_activity(r).await?,
        ))),
        StderrKind::StopActivity => Ok(Some(Stderr::StopActivity {
            act_id: read_u64(r).await.with_field("StopActivity.act_id")?,
        })),
        StderrKind::Result => Ok(Some(Stderr::Result(read_stderr_result(r).await?))),
    }
    .tap_ok(|stderr| trace!(?stderr, "<-"))
}
#[instrument(skip(r), level = "trace")]
pub async fn read_stderr_start_activity<R: AsyncReadExt + Unpin>(
    r: &mut R,
) -> Result<StderrStartActivity> {
    Ok(StderrStartActivity {
        act_id: read_u64(r).await.with_field("StartActivity.act_id")?,
        level: read_u64(r).await.with_field("StartActivity.level")?,
        kind: read_u64(r).await.with_field("StartActivity.kind")?,
        s: read_string(r, MAX_STRING_LEN)
            .await
            .with_field("StartActivity.s")?,
        fields: read_stderr_fields(r).await?,
        parent_id: read_u64(r).await.with_field("StartActivity.parent_id")?,
    }
    .tap(|act| trace!(?act, "<-")))
}
#[instrument(skip(r), level = "trace")]
pub async fn read_stderr_result<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<StderrResult> {
    Ok(StderrResult {
        act_id: read_u64(r).await.with_field("Result.act_id")?,
        kind: read_u64(r).await.with_field("Result.kind")?,
        fields: read_stderr_fields(r).await?,
    }
    .tap(|res| trace!(?res, "<-")))
}
/// Read an activity's field list: a u64 count, then that many (tag, value) pairs,
/// where tag 0 is a u64 and tag 1 a string.
#[instrument(skip(r), level = "trace")]
pub async fn read_stderr_fields<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Vec<StderrField>> {
    let count = read_u64(r)
        .await
        .with_field("fields.<count>")?
        .tap(|count| trace!(count, "fields[].<count>")) as usize;
    let mut fields = Vec::with_capacity(count.min(64));
    for n in 0..count {
        let field = match read_u64(r).await.with_field("fields[].<type>")? {
            0 => StderrField::Int(read_u64(r).await.with_field("fields[].int")?),
            1 => StderrField::String(
                read_string(r, MAX_STRING_LEN)
                    .await
                    .with_field("fields[].string")?,
            ),
            tag => return Err(Error::UnknownFieldTag(tag)),
        };
        trace!(n, count, ?field, "fields[]");
        fields.push(field);
    }
    Ok(fields)
}

/// Consumes stderr messages up to and including `Last`, writing any log text to `sink`
/// if there is one. Activities and results are discarded. An error frame ends the
/// loop with [`Error::DaemonError`], with the stream still aligned.
#[instrument(skip(r, sink), level = "trace")]
pub async fn drain_stderr<R, W>(r: &mut R, proto: Proto, mut sink: Option<&mut W>) -> Result<()>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    while let Some(stderr) = read_stderr(r, proto).await? {
        match stderr {
            Stderr::Error(msg) => return Err(Error::DaemonError(msg)),
            Stderr::Write(b) | Stderr::Next(b) => {
                if let Some(sink) = sink.as_mut() {
                    sink.write_all(&b).await?;
                }
            }
            stderr => trace!(?stderr, "Discarding"),
        }
    }
    if let Some(sink) = sink.as_mut() {
        sink.flush().await?;
    }
    Ok(())
}

/// Writes a ClientSettings structure to the stream.
#[instrument(skip(w, cs), level = "trace")]
pub async fn write_client_settings<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    cs: &ClientSettings,
) -> Result<()> {
    write_bool(w, cs.keep_failed)
        .await
        .with_field("ClientSettings.keep_failed")?;
    write_bool(w, cs.keep_going)
        .await
        .with_field("ClientSettings.keep_going")?;
    write_bool(w, cs.try_fallback)
        .await
        .with_field("ClientSettings.try_fallback")?;

    write_verbosity(w, cs.verbosity)
        .await
        .with_field("ClientSettings.verbosity")?;
    write_u64(w, cs.max_build_jobs)
        .await
        .with_field("ClientSettings.max_build_jobs")?;
    write_u64(w, cs.max_silent_time)
        .await
        .with_field("ClientSettings.max_silent_time")?;
    write_bool(w, cs.use_build_hook)
        .await
        .with_field("ClientSettings.__obsolete_use_build_hook")?;
    write_verbosity(w, cs.build_verbosity)
        .await
        .with_field("ClientSettings.build_verbosity")?;
    write_u64(w, 0)
        .await
        .with_field("ClientSettings.__obsolete_log_type")?;
    write_u64(w, 0)
        .await
        .with_field("ClientSettings.__obsolete_print_build_trace")?;
    write_u64(w, cs.build_cores)
        .await
        .with_field("ClientSettings.build_cores")?;
    write_bool(w, cs.use_substitutes)
        .await
        .with_field("ClientSettings.use_substitutes")?;

    write_u64(w, cs.overrides.len() as u64)
        .await
        .with_field("ClientSettings.overrides.<count>")?;
    for (key, value) in cs.overrides.iter() {
        write_string(w, key)
            .await
            .with_field("ClientSettings.overrides[].key")?;
        write_string(w, value)
            .await
            .with_field("ClientSettings.overrides[].value")?;
    }

    Ok(())
}

/// Read a PathInfo structure from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn read_pathinfo<R: AsyncReadExt + Unpin>(r: &mut R, proto: Proto) -> Result<PathInfo> {
    let deriver = read_string(r, MAX_STRING_LEN)
        .await
        .map(|s| (!s.is_empty()).then_some(s)) // "" -> None.
        .with_field("PathInfo.deriver")?;
    let nar_hash = read_string(r, MAX_STRING_LEN)
        .await
        .with_field("PathInfo.nar_hash")?;
    let references = read_strings(r, MAX_STRING_LEN)
        .collect::<Result<Vec<_>>>()
        .await
        .with_field("PathInfo.references")?;
    let registration_time = read_datetime(r)
        .await
        .with_field("PathInfo.registration_time")?;
    let nar_size = read_u64(r).await.with_field("PathInfo.nar_size")?;

    let ultimate = OptionFuture::from(proto.since(16).then(|| read_bool(r)))
        .await
        .transpose()
        .with_field("PathInfo.ultimate")?
        .unwrap_or_default();
    let signatures = OptionFuture::from(
        proto
            .since(16)
            .then(|| read_strings(r, MAX_STRING_LEN).collect::<Result<Vec<_>>>()),
    )
    .await
    .transpose()
    .with_field("PathInfo.signatures")?
    .unwrap_or_default();
    let ca = OptionFuture::from(proto.since(16).then(|| read_string(r, MAX_STRING_LEN)))
        .await
        .transpose()
        .with_field("PathInfo.ca")?
        .and_then(|s| (!s.is_empty()).then_some(s)); // "" -> None.

    Ok(PathInfo {
        deriver,
        nar_hash,
        references,
        registration_time,
        nar_size,
        ultimate,
        signatures,
        ca,
    })
}

/// Read a store path followed by its PathInfo, keeping only the path.
#[instrument(skip(r), level = "trace")]
pub async fn read_valid_path_info<R: AsyncReadExt + Unpin>(
    r: &mut R,
    proto: Proto,
) -> Result<String> {
    let path = read_string(r, MAX_STRING_LEN)
        .await
        .with_field("ValidPathInfo.path")?;
    let pi = read_pathinfo(r, proto)
        .await
        .with_field("ValidPathInfo.info")?;
    debug!(path = path.as_str(), ?pi, "Discarding PathInfo");
    Ok(path)
}

/// Writes a Derivation in the BasicDerivation layout BuildDerivation expects.
///
/// Outputs and the environment are written sorted by key, input sources sorted, and
/// arguments in their original order, so equal derivations always produce equal bytes.
#[instrument(skip(w, drv), fields(drv.name = drv.name.as_str()), level = "trace")]
pub async fn write_derivation<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    drv: &Derivation,
) -> Result<()> {
    let outputs = drv.outputs.iter().collect::<BTreeMap<_, _>>();
    write_u64(w, outputs.len() as u64)
        .await
        .with_field("Derivation.outputs.<count>")?;
    for (name, output) in outputs {
        write_string(w, name)
            .await
            .with_field("Derivation.outputs[].name")?;
        write_string(w, &output.path)
            .await
            .with_field("Derivation.outputs[].path")?;
        write_string(w, &output.hash_algorithm)
            .await
            .with_field("Derivation.outputs[].hash_algorithm")?;
        write_string(w, &output.hash)
            .await
            .with_field("Derivation.outputs[].hash")?;
    }

    write_string_set(w, &drv.input_sources)
        .await
        .with_field("Derivation.input_sources")?;
    write_string(w, &drv.platform)
        .await
        .with_field("Derivation.platform")?;
    write_string(w, &drv.builder)
        .await
        .with_field("Derivation.builder")?;
    write_strings(w, &drv.args)
        .await
        .with_field("Derivation.args")?;

    let env = drv.env.iter().collect::<BTreeMap<_, _>>();
    write_u64(w, env.len() as u64)
        .await
        .with_field("Derivation.env.<count>")?;
    for (key, value) in env {
        write_string(w, key)
            .await
            .with_field("Derivation.env[].key")?;
        write_string(w, value)
            .await
            .with_field("Derivation.env[].value")?;
    }

    Ok(())
}
