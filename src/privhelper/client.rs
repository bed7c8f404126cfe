//! client side of the privileged helper, running in the unprivileged
//! parent process

use std::os::fd::OwnedFd;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::privhelper::conn::{
    parse_empty_response, serialize_bind_mount_request, serialize_mount_request,
    serialize_unmount_request, Message, PrivHelperConn,
};

/// how far behind a reply xid may lag before the mismatch is fatal
const STALE_XID_WINDOW: u32 = 5;
const MAX_STALE_RETRIES: u32 = 5;

struct ClientState {
    conn: Option<PrivHelperConn>,
    next_xid: u32,
}

/// handle to the privileged helper subprocess
///
/// one request is in flight at a time: the helper is single-threaded, so
/// the request/response exchange runs under a mutex.
pub struct PrivHelperClient {
    state: Mutex<ClientState>,
    helper_pid: Option<Pid>,
}

impl PrivHelperClient {
    pub(crate) fn new(conn: PrivHelperConn, helper_pid: Option<Pid>) -> PrivHelperClient {
        PrivHelperClient {
            state: Mutex::new(ClientState {
                conn: Some(conn),
                next_xid: 1,
            }),
            helper_pid,
        }
    }

    /// send one request and receive its reply
    ///
    /// a reply for a recently timed-out request may arrive first; such
    /// stale replies are discarded a bounded number of times, anything
    /// else is a fatal protocol mismatch.
    fn send_and_recv(
        &self,
        build: impl FnOnce(u32) -> Message,
    ) -> Result<(Message, Option<OwnedFd>)> {
        let mut state = self.state.lock();
        let request_xid = state.next_xid;
        state.next_xid += 1;

        let conn = state
            .conn
            .as_ref()
            .ok_or_else(|| Error::Internal("privhelper connection is closed".to_string()))?;
        conn.send_msg(&build(request_xid), None)?;

        let mut retries = 0;
        loop {
            let (reply, fd) = conn
                .recv_msg()?
                .ok_or_else(|| Error::Internal("privhelper exited".to_string()))?;
            if reply.xid == request_xid {
                return Ok((reply, fd));
            }
            if reply.xid < request_xid
                && reply.xid + STALE_XID_WINDOW >= request_xid
                && retries < MAX_STALE_RETRIES
            {
                warn!(
                    stale = reply.xid,
                    waiting_for = request_xid,
                    "ignoring stale privhelper response"
                );
                retries += 1;
                continue;
            }
            return Err(Error::Internal(format!(
                "mismatched privhelper response: request xid was {}; got response xid {}",
                request_xid, reply.xid
            )));
        }
    }

    /// ask the helper to mount; returns the opened device fd
    pub fn fuse_mount(&self, mount_path: &str) -> Result<OwnedFd> {
        let (reply, fd) = self.send_and_recv(|xid| serialize_mount_request(xid, mount_path))?;
        parse_empty_response(&reply)?;
        fd.ok_or_else(|| {
            Error::Internal("no file descriptor in privhelper mount response".to_string())
        })
    }

    pub fn fuse_unmount(&self, mount_path: &str) -> Result<()> {
        let (reply, _) = self.send_and_recv(|xid| serialize_unmount_request(xid, mount_path))?;
        parse_empty_response(&reply)
    }

    pub fn bind_mount(&self, client_path: &str, mount_path: &str) -> Result<()> {
        let (reply, _) =
            self.send_and_recv(|xid| serialize_bind_mount_request(xid, client_path, mount_path))?;
        parse_empty_response(&reply)
    }

    /// drop the parent's privileges after the helper has been forked
    pub fn drop_privileges(&self, uid: u32, gid: u32) -> Result<()> {
        // group first: dropping uid first would lose the right to setregid
        let rc = unsafe { nix::libc::setregid(gid, gid) };
        if rc != 0 {
            return Err(Error::Internal(format!(
                "failed to drop group privileges: {}",
                std::io::Error::last_os_error()
            )));
        }
        let rc = unsafe { nix::libc::setreuid(uid, uid) };
        if rc != 0 {
            return Err(Error::Internal(format!(
                "failed to drop user privileges: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// close the socket, wait for the helper to exit, and report its exit
    /// code (negative when killed by a signal)
    pub fn stop(&self) -> Result<i32> {
        let conn = self
            .state
            .lock()
            .conn
            .take()
            .ok_or_else(|| Error::Internal("privhelper already stopped".to_string()))?;
        // closing the socket signals the helper to exit
        drop(conn);

        let pid = match self.helper_pid {
            Some(pid) => pid,
            None => return Ok(0),
        };
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!(code, "privhelper exited");
                    return Ok(code);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    debug!(?signal, "privhelper killed by signal");
                    return Ok(-(signal as i32));
                }
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(Error::Internal(format!(
                        "error waiting on privhelper process: {}",
                        e
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privhelper::conn::{parse_unmount_request, serialize_empty_response, MsgType};

    /// scripted single-threaded peer standing in for the helper process
    fn scripted_client(
        script: impl FnOnce(PrivHelperConn) + Send + 'static,
    ) -> (PrivHelperClient, std::thread::JoinHandle<()>) {
        let (client_conn, server_conn) = PrivHelperConn::create_pair().unwrap();
        let handle = std::thread::spawn(move || script(server_conn));
        (PrivHelperClient::new(client_conn, None), handle)
    }

    #[test]
    fn test_xids_start_at_one_and_increase() {
        let (client, handle) = scripted_client(|conn| {
            for expected in 1..=3u32 {
                let (msg, _) = conn.recv_msg().unwrap().unwrap();
                assert_eq!(msg.xid, expected);
                assert_eq!(MsgType::from_u32(msg.msg_type), Some(MsgType::Unmount));
                assert_eq!(parse_unmount_request(&msg).unwrap(), "/mnt/repo");
                conn.send_msg(&serialize_empty_response(msg.xid), None)
                    .unwrap();
            }
        });

        for _ in 0..3 {
            client.fuse_unmount("/mnt/repo").unwrap();
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_stale_reply_is_discarded() {
        let (client, handle) = scripted_client(|conn| {
            // bring the client up to xid 7
            for _ in 0..6 {
                let (msg, _) = conn.recv_msg().unwrap().unwrap();
                conn.send_msg(&serialize_empty_response(msg.xid), None)
                    .unwrap();
            }
            // request 7: a late reply to request 6 sneaks in first
            let (msg, _) = conn.recv_msg().unwrap().unwrap();
            assert_eq!(msg.xid, 7);
            conn.send_msg(&serialize_empty_response(6), None).unwrap();
            conn.send_msg(&serialize_empty_response(7), None).unwrap();
        });

        for _ in 0..6 {
            client.fuse_unmount("/mnt/repo").unwrap();
        }
        // the stale xid-6 reply is skipped and the real one accepted
        client.fuse_unmount("/mnt/repo").unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_ancient_reply_is_fatal() {
        let (client, handle) = scripted_client(|conn| {
            for _ in 0..6 {
                let (msg, _) = conn.recv_msg().unwrap().unwrap();
                conn.send_msg(&serialize_empty_response(msg.xid), None)
                    .unwrap();
            }
            // request 7 answered with xid 1: outside the stale window
            let _ = conn.recv_msg().unwrap().unwrap();
            conn.send_msg(&serialize_empty_response(1), None).unwrap();
        });

        for _ in 0..6 {
            client.fuse_unmount("/mnt/repo").unwrap();
        }
        let err = client.fuse_unmount("/mnt/repo").unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(err.to_string().contains("mismatched"));
        handle.join().unwrap();
    }

    #[test]
    fn test_future_reply_is_fatal() {
        let (client, handle) = scripted_client(|conn| {
            let (msg, _) = conn.recv_msg().unwrap().unwrap();
            conn.send_msg(&serialize_empty_response(msg.xid + 1), None)
                .unwrap();
        });

        assert!(matches!(
            client.fuse_unmount("/mnt/repo"),
            Err(Error::Internal(_))
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_helper_exit_surfaces_as_error() {
        let (client, handle) = scripted_client(|conn| {
            let _ = conn.recv_msg();
            // drop the connection without replying
        });

        assert!(matches!(
            client.fuse_unmount("/mnt/repo"),
            Err(Error::Internal(_))
        ));
        handle.join().unwrap();
    }
}
