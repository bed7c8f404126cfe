//! server side of the privileged helper, running in the forked child
//!
//! single-threaded: one request is received, handled, and answered at a
//! time. the server exits when the client closes its socket.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use nix::mount::{mount, umount, MsFlags};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::privhelper::conn::{
    parse_bind_mount_request, parse_mount_request, parse_unmount_request,
    serialize_empty_response, serialize_error_response, Message, MsgType, PrivHelperConn,
};

pub struct PrivHelperServer {
    conn: PrivHelperConn,
    uid: u32,
    gid: u32,
}

impl PrivHelperServer {
    pub fn new(conn: PrivHelperConn, uid: u32, gid: u32) -> PrivHelperServer {
        PrivHelperServer { conn, uid, gid }
    }

    /// serve requests until the client closes the socket
    pub fn run(&mut self) -> Result<()> {
        loop {
            let request = match self.conn.recv_msg()? {
                Some((request, _)) => request,
                // client closed its end: time to exit
                None => return Ok(()),
            };
            let (reply, fd) = self.handle(&request);
            self.conn
                .send_msg(&reply, fd.as_ref().map(|fd| fd.as_raw_fd()))?;
        }
    }

    /// dispatch one request; errors become error replies
    pub(crate) fn handle(&self, request: &Message) -> (Message, Option<OwnedFd>) {
        let result = match MsgType::from_u32(request.msg_type) {
            Some(MsgType::Mount) => match parse_mount_request(request) {
                Ok(path) => self.do_mount(&path).map(Some),
                Err(e) => Err(e),
            },
            Some(MsgType::Unmount) => match parse_unmount_request(request) {
                Ok(path) => self.do_unmount(&path).map(|()| None),
                Err(e) => Err(e),
            },
            Some(MsgType::BindMount) => match parse_bind_mount_request(request) {
                Ok((client_path, mount_path)) => {
                    self.do_bind_mount(&client_path, &mount_path).map(|()| None)
                }
                Err(e) => Err(e),
            },
            _ => Err(Error::InvalidArgument(format!(
                "unexpected privhelper request type {}",
                request.msg_type
            ))),
        };

        match result {
            Ok(fd) => (serialize_empty_response(request.xid), fd),
            Err(e) => {
                error!(xid = request.xid, error = %e, "privhelper request failed");
                (
                    serialize_error_response(request.xid, e.as_errno(), &e.to_string()),
                    None,
                )
            }
        }
    }

    /// open the fuse device and mount it at `mount_path`; the fd goes back
    /// to the client with the reply
    fn do_mount(&self, mount_path: &str) -> Result<OwnedFd> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/fuse")
            .map_err(|source| Error::Io {
                path: "/dev/fuse".into(),
                source,
            })?;

        let options = format!(
            "fd={},rootmode=40000,user_id={},group_id={},allow_other,default_permissions",
            device.as_raw_fd(),
            self.uid,
            self.gid
        );
        mount(
            Some("mirage"),
            Path::new(mount_path),
            Some("fuse"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(options.as_str()),
        )
        .map_err(|e| Error::from_errno(e as i32, mount_path))?;

        debug!(mount_path, "mounted");
        Ok(OwnedFd::from(device))
    }

    fn do_unmount(&self, mount_path: &str) -> Result<()> {
        umount(Path::new(mount_path)).map_err(|e| Error::from_errno(e as i32, mount_path))?;
        debug!(mount_path, "unmounted");
        Ok(())
    }

    fn do_bind_mount(&self, client_path: &str, mount_path: &str) -> Result<()> {
        mount(
            Some(Path::new(client_path)),
            Path::new(mount_path),
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| Error::from_errno(e as i32, mount_path))?;
        debug!(client_path, mount_path, "bind mounted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privhelper::conn::parse_empty_response;

    fn test_server() -> (PrivHelperServer, PrivHelperConn) {
        let (client, server) = PrivHelperConn::create_pair().unwrap();
        (PrivHelperServer::new(server, 1000, 1000), client)
    }

    #[test]
    fn test_unknown_request_type_is_answered() {
        let (server, _client) = test_server();
        let bogus = Message {
            xid: 12,
            msg_type: 999,
            body: Vec::new(),
        };
        let (reply, fd) = server.handle(&bogus);
        assert_eq!(reply.xid, 12);
        assert!(fd.is_none());
        let err = parse_empty_response(&reply).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_malformed_mount_request_is_answered() {
        let (server, _client) = test_server();
        let truncated = Message {
            xid: 3,
            msg_type: MsgType::Mount as u32,
            body: vec![0xff],
        };
        let (reply, _) = server.handle(&truncated);
        assert_eq!(reply.xid, 3);
        assert!(parse_empty_response(&reply).is_err());
    }

    #[test]
    fn test_unmount_failure_reports_errno() {
        let (server, _client) = test_server();
        // not a mount point (and we are unprivileged): the errno comes back
        let request = crate::privhelper::conn::serialize_unmount_request(
            5,
            "/definitely/not/a/mount/point",
        );
        let (reply, _) = server.handle(&request);
        assert_eq!(reply.xid, 5);
        assert!(parse_empty_response(&reply).is_err());
    }
}
