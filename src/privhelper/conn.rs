//! datagram wire protocol between the unprivileged process and the
//! privileged helper
//!
//! one message per datagram: host-endian `xid`, `msg_type`, then a body of
//! at most 4 KiB. a mount reply carries the opened device fd as ancillary
//! data.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};

use crate::error::{Error, Result};

pub const MAX_BODY: usize = 4096;
const HEADER_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    Mount = 1,
    Unmount = 2,
    BindMount = 3,
    EmptyResponse = 4,
    ErrorResponse = 5,
}

impl MsgType {
    pub fn from_u32(value: u32) -> Option<MsgType> {
        match value {
            1 => Some(MsgType::Mount),
            2 => Some(MsgType::Unmount),
            3 => Some(MsgType::BindMount),
            4 => Some(MsgType::EmptyResponse),
            5 => Some(MsgType::ErrorResponse),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub xid: u32,
    pub msg_type: u32,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(xid: u32, msg_type: MsgType, body: Vec<u8>) -> Message {
        Message {
            xid,
            msg_type: msg_type as u32,
            body,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        if self.body.len() > MAX_BODY {
            return Err(Error::InvalidArgument(format!(
                "privhelper message body of {} bytes exceeds the {} byte limit",
                self.body.len(),
                MAX_BODY
            )));
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.body.len());
        buf.extend_from_slice(&self.xid.to_ne_bytes());
        buf.extend_from_slice(&self.msg_type.to_ne_bytes());
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    fn decode(data: &[u8]) -> Result<Message> {
        if data.len() < HEADER_LEN {
            return Err(Error::Internal(format!(
                "short privhelper message: {} bytes",
                data.len()
            )));
        }
        Ok(Message {
            xid: u32::from_ne_bytes(data[0..4].try_into().expect("length checked")),
            msg_type: u32::from_ne_bytes(data[4..8].try_into().expect("length checked")),
            body: data[HEADER_LEN..].to_vec(),
        })
    }
}

/// one end of the helper socket pair
pub struct PrivHelperConn {
    fd: OwnedFd,
}

impl PrivHelperConn {
    /// create the connected (client, server) pair
    pub fn create_pair() -> Result<(PrivHelperConn, PrivHelperConn)> {
        let (client, server) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| Error::Internal(format!("socketpair failed: {}", e)))?;
        Ok((PrivHelperConn { fd: client }, PrivHelperConn { fd: server }))
    }

    pub fn send_msg(&self, msg: &Message, fd: Option<RawFd>) -> Result<()> {
        let buf = msg.encode()?;
        let iov = [IoSlice::new(&buf)];
        let fds;
        let cmsgs: Vec<ControlMessage<'_>> = match fd {
            Some(fd) => {
                fds = [fd];
                vec![ControlMessage::ScmRights(&fds)]
            }
            None => Vec::new(),
        };
        sendmsg::<()>(self.fd.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
            .map_err(|e| Error::Internal(format!("privhelper send failed: {}", e)))?;
        Ok(())
    }

    /// receive one message; `None` means the peer closed its end
    pub fn recv_msg(&self) -> Result<Option<(Message, Option<OwnedFd>)>> {
        let mut buf = vec![0u8; HEADER_LEN + MAX_BODY];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

        let (bytes, received_fd) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            )
            .map_err(|e| Error::Internal(format!("privhelper recv failed: {}", e)))?;

            let mut received_fd = None;
            let cmsgs = msg
                .cmsgs()
                .map_err(|e| Error::Internal(format!("privhelper cmsg decode failed: {}", e)))?;
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    received_fd = fds.into_iter().next().map(|fd|
                        // received via SCM_RIGHTS, so the fd is ours to own
                        unsafe { std::os::fd::FromRawFd::from_raw_fd(fd) });
                }
            }
            (msg.bytes, received_fd)
        };

        if bytes == 0 {
            return Ok(None);
        }
        Ok(Some((Message::decode(&buf[..bytes])?, received_fd)))
    }
}

// --- request/response body codecs ---

fn put_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_ne_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn take_string(data: &[u8], offset: &mut usize) -> Result<String> {
    let short = || Error::Internal("truncated privhelper message body".to_string());
    if data.len() < *offset + 4 {
        return Err(short());
    }
    let len =
        u32::from_ne_bytes(data[*offset..*offset + 4].try_into().expect("length checked")) as usize;
    *offset += 4;
    if data.len() < *offset + len {
        return Err(short());
    }
    let value = String::from_utf8(data[*offset..*offset + len].to_vec())
        .map_err(|_| Error::Internal("non-utf8 path in privhelper message".to_string()))?;
    *offset += len;
    Ok(value)
}

pub fn serialize_mount_request(xid: u32, mount_path: &str) -> Message {
    let mut body = Vec::new();
    put_string(&mut body, mount_path);
    Message::new(xid, MsgType::Mount, body)
}

pub fn parse_mount_request(msg: &Message) -> Result<String> {
    let mut offset = 0;
    take_string(&msg.body, &mut offset)
}

pub fn serialize_unmount_request(xid: u32, mount_path: &str) -> Message {
    let mut body = Vec::new();
    put_string(&mut body, mount_path);
    Message::new(xid, MsgType::Unmount, body)
}

pub fn parse_unmount_request(msg: &Message) -> Result<String> {
    let mut offset = 0;
    take_string(&msg.body, &mut offset)
}

pub fn serialize_bind_mount_request(xid: u32, client_path: &str, mount_path: &str) -> Message {
    let mut body = Vec::new();
    put_string(&mut body, client_path);
    put_string(&mut body, mount_path);
    Message::new(xid, MsgType::BindMount, body)
}

pub fn parse_bind_mount_request(msg: &Message) -> Result<(String, String)> {
    let mut offset = 0;
    let client_path = take_string(&msg.body, &mut offset)?;
    let mount_path = take_string(&msg.body, &mut offset)?;
    Ok((client_path, mount_path))
}

pub fn serialize_empty_response(xid: u32) -> Message {
    Message::new(xid, MsgType::EmptyResponse, Vec::new())
}

pub fn serialize_error_response(xid: u32, errno: i32, message: &str) -> Message {
    let mut body = Vec::new();
    body.extend_from_slice(&errno.to_ne_bytes());
    put_string(&mut body, message);
    Message::new(xid, MsgType::ErrorResponse, body)
}

/// interpret a reply that carries no payload
pub fn parse_empty_response(msg: &Message) -> Result<()> {
    match MsgType::from_u32(msg.msg_type) {
        Some(MsgType::EmptyResponse) => Ok(()),
        Some(MsgType::ErrorResponse) => {
            let errno = i32::from_ne_bytes(
                msg.body
                    .get(0..4)
                    .ok_or_else(|| {
                        Error::Internal("truncated privhelper error response".to_string())
                    })?
                    .try_into()
                    .expect("length checked"),
            );
            let mut offset = 4;
            let message = take_string(&msg.body, &mut offset)?;
            Err(Error::from_errno(errno, &message))
        }
        _ => Err(Error::Internal(format!(
            "unexpected privhelper response type {}",
            msg.msg_type
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, Write};

    #[test]
    fn test_message_roundtrip_over_socketpair() {
        let (client, server) = PrivHelperConn::create_pair().unwrap();

        let request = serialize_mount_request(3, "/mnt/repo");
        client.send_msg(&request, None).unwrap();

        let (received, fd) = server.recv_msg().unwrap().unwrap();
        assert_eq!(received, request);
        assert!(fd.is_none());
        assert_eq!(parse_mount_request(&received).unwrap(), "/mnt/repo");
    }

    #[test]
    fn test_fd_passing() {
        let (client, server) = PrivHelperConn::create_pair().unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"through the socket").unwrap();
        file.rewind().unwrap();

        server
            .send_msg(&serialize_empty_response(1), Some(file.as_raw_fd()))
            .unwrap();
        let (reply, fd) = client.recv_msg().unwrap().unwrap();
        parse_empty_response(&reply).unwrap();

        let mut received = std::fs::File::from(fd.expect("fd delivered"));
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "through the socket");
    }

    #[test]
    fn test_recv_none_on_peer_close() {
        let (client, server) = PrivHelperConn::create_pair().unwrap();
        drop(client);
        assert!(server.recv_msg().unwrap().is_none());
    }

    #[test]
    fn test_bind_mount_body() {
        let msg = serialize_bind_mount_request(9, "/client/buck-out", "/mnt/repo/buck-out");
        let (client_path, mount_path) = parse_bind_mount_request(&msg).unwrap();
        assert_eq!(client_path, "/client/buck-out");
        assert_eq!(mount_path, "/mnt/repo/buck-out");
    }

    #[test]
    fn test_error_response_carries_errno() {
        let msg = serialize_error_response(2, 13, "mount failed");
        let err = parse_empty_response(&msg).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert_eq!(err.as_errno(), 13);
    }

    #[test]
    fn test_oversized_body_rejected() {
        let msg = Message::new(1, MsgType::Mount, vec![0u8; MAX_BODY + 1]);
        let (client, _server) = PrivHelperConn::create_pair().unwrap();
        assert!(matches!(
            client.send_msg(&msg, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let msg = Message {
            xid: 1,
            msg_type: MsgType::BindMount as u32,
            body: serialize_mount_request(1, "/only-one-string").body,
        };
        assert!(parse_bind_mount_request(&msg).is_err());
    }
}
