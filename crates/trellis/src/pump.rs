//! Per-stream read/write servicing used by both update loops.

use std::io::{self, Read};

use mio::{Interest, Token};
use tracing::{debug, trace, warn};

use crate::{
    connection::Connection,
    error::CloseReason,
    frame::ReadBuf,
    msg::Ping,
    serialize::{Object, Registry},
};

/// One registered stream: the socket, its inbound buffer and the connection
/// handle. The read buffer is touched only by the update loop.
pub(crate) struct Chan {
    pub(crate) stream: mio::net::TcpStream,
    pub(crate) read: ReadBuf,
    pub(crate) conn: Connection,
    /// Whether WRITABLE interest is currently registered.
    pub(crate) armed: bool,
}

/// Reads until the kernel blocks, dispatching every complete frame through
/// `handler`. The connection is serviced to completion before returning.
pub(crate) fn service_read(
    chan: &mut Chan,
    registry: &Registry,
    handler: &mut dyn FnMut(&Connection, Object) -> Result<(), CloseReason>,
) -> Result<(), CloseReason> {
    loop {
        if chan.read.space().is_empty() {
            // cannot happen for frames within the object buffer limit
            return Err(CloseReason::FrameTooLarge);
        }
        match chan.stream.read(chan.read.space()) {
            Ok(0) => return Err(CloseReason::PeerClosed),
            Ok(n) => {
                chan.read.advance(n);
                chan.conn.touch_recv();
                drain_frames(chan, registry, handler)?;
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(connection = chan.conn.id(), ?err, "stream read failed");
                return Err(CloseReason::Io);
            }
        }
    }
}

fn drain_frames(
    chan: &mut Chan,
    registry: &Registry,
    handler: &mut dyn FnMut(&Connection, Object) -> Result<(), CloseReason>,
) -> Result<(), CloseReason> {
    loop {
        let bounds = chan.read.frame_bounds().map_err(|err| {
            warn!(connection = chan.conn.id(), ?err, "bad frame prefix");
            err.close_reason()
        })?;
        let Some((start, end)) = bounds else { return Ok(()) };
        if start == end {
            // keep-alive; receipt already refreshed the timeout clock
            chan.read.consume(end);
            continue;
        }
        let decoded = registry.decode(chan.read.payload(start, end));
        chan.read.consume(end);
        match decoded {
            Ok(object) => handler(&chan.conn, object)?,
            Err(err) => {
                warn!(connection = chan.conn.id(), %err, "dropping undecodable frame");
            }
        }
    }
}

/// Drains queued writes; drops WRITABLE interest once empty and fires `idle`
/// when the drain leaves the buffer sufficiently free.
pub(crate) fn service_write(
    chan: &mut Chan,
    registry: &mio::Registry,
    token: Token,
) -> Result<(), CloseReason> {
    if chan.conn.drain_write(&mut chan.stream)? {
        if chan.armed {
            registry
                .reregister(&mut chan.stream, token, Interest::READABLE)
                .map_err(|err| {
                    debug!(?err, "dropping writable interest failed");
                    CloseReason::Io
                })?;
            chan.armed = false;
        }
        chan.conn.maybe_notify_idle();
    }
    Ok(())
}

/// Arms WRITABLE interest for a stream with queued data.
pub(crate) fn arm_if_needed(
    chan: &mut Chan,
    registry: &mio::Registry,
    token: Token,
) -> Result<(), CloseReason> {
    if !chan.armed && chan.conn.wants_write() {
        registry
            .reregister(&mut chan.stream, token, Interest::READABLE | Interest::WRITABLE)
            .map_err(|err| {
                debug!(?err, "arming writable interest failed");
                CloseReason::Io
            })?;
        chan.armed = true;
    }
    Ok(())
}

/// Echoes a probe or records the measured round trip.
pub(crate) fn handle_ping(conn: &Connection, ping: &Ping) {
    if ping.is_reply {
        conn.note_ping_reply(ping.id);
    } else if let Err(err) = conn.send_tcp(&Ping { id: ping.id, is_reply: true }) {
        trace!(connection = conn.id(), %err, "ping echo dropped");
    }
}
