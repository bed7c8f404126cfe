//! privileged helper subprocess
//!
//! the main process runs unprivileged; mount-capable syscalls are executed
//! by a child forked at startup while the process still holds privileges.
//! the two talk over a socket pair, one request in flight at a time.

mod client;
mod conn;
mod server;

pub use client::PrivHelperClient;
pub use conn::{Message, MsgType, PrivHelperConn, MAX_BODY};
pub use server::PrivHelperServer;

use nix::unistd::{fork, ForkResult};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// fork the privileged helper
///
/// the parent receives the client handle and should drop its privileges to
/// `uid`/`gid` afterwards; the child never returns.
pub fn start_priv_helper(uid: u32, gid: u32) -> Result<PrivHelperClient> {
    let (client_conn, server_conn) = PrivHelperConn::create_pair()?;

    match unsafe { fork() }
        .map_err(|e| Error::Internal(format!("failed to fork mount helper: {}", e)))?
    {
        ForkResult::Parent { child } => {
            drop(server_conn);
            debug!(pid = child.as_raw(), "forked mount helper process");
            Ok(PrivHelperClient::new(client_conn, Some(child)))
        }
        ForkResult::Child => {
            drop(client_conn);
            let mut server = PrivHelperServer::new(server_conn, uid, gid);
            let code = match server.run() {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %e, "error inside mount helper");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}
