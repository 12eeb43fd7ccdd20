// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The interpreter subprocess and its pipe. Calls are synchronous on the
//! owning room thread, and the protocol is reentrant: while we wait for a
//! response, the engine may issue its own requests into the server, which
//! are dispatched and answered before the outer wait resumes.

use crate::game::dispatchers;
use crate::server::Server;
use croupier_rpc::{Param, RpcMessage, decode_message, encode_request, next_request_id};
use eyre::WrapErr;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Working directory and entry script of the interpreter. External
/// contract: the core only requires a process that speaks the RPC.
const ENGINE_DIR: &str = "packages/freekill-core";
const ENGINE_CMD: &str = "lua5.4";
const ENGINE_ENTRY: &str = "lua/server/rpc/entry.lua";

const READ_CHUNK: usize = 32 * 1024;

enum WaitFor<'a> {
    Response(i32, &'a str),
    Notification(&'a str),
}

pub struct Engine {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    buffer: Vec<u8>,
    dead: bool,
}

impl Engine {
    /// Fork the interpreter with its stdio bound to our pipes and wait for
    /// its `hello`.
    pub fn spawn(server: &Arc<Server>) -> Result<Self, eyre::Error> {
        let disabled = server.packman().disabled_packs();
        let disabled_json =
            serde_json::to_string(&disabled).wrap_err("cannot encode disabled packs")?;

        let mut child = Command::new(ENGINE_CMD)
            .arg(ENGINE_ENTRY)
            .current_dir(ENGINE_DIR)
            .env("FK_DISABLED_PACKS", disabled_json)
            .env("FK_RPC_MODE", "cbor")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .wrap_err_with(|| {
                format!(
                    "cannot spawn {ENGINE_CMD} in {ENGINE_DIR}; is the core content package installed?"
                )
            })?;

        let stdin = child.stdin.take().expect("engine stdin piped");
        let stdout = child.stdout.take().expect("engine stdout piped");

        let mut engine = Self {
            child,
            stdin,
            stdout,
            buffer: Vec::new(),
            dead: false,
        };
        engine.wait_for(server, WaitFor::Notification("hello"));
        Ok(engine)
    }

    pub fn alive(&mut self) -> bool {
        if self.dead {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            _ => {
                self.dead = true;
                false
            }
        }
    }

    pub fn connection_info(&mut self) -> String {
        format!(
            "PID {}{}",
            self.child.id(),
            if self.alive() { "" } else { " (died)" }
        )
    }

    /// One request/response round trip. Nothing is returned: the server
    /// never consumes engine results, it only needs the call to complete
    /// (and any nested callbacks serviced) before moving on.
    pub fn call(&mut self, server: &Arc<Server>, method: &str, params: &[Param]) {
        if !self.alive() {
            return;
        }

        let id = next_request_id();
        let buf = encode_request(method, params, id);
        if self.stdin.write_all(&buf).is_err() || self.stdin.flush().is_err() {
            self.dead = true;
            return;
        }

        self.wait_for(server, WaitFor::Response(id, method));
    }

    /// Read until the expected message shows up, servicing any engine
    /// requests that arrive in between.
    fn wait_for(&mut self, server: &Arc<Server>, expect: WaitFor<'_>) {
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            // drain complete messages already buffered
            loop {
                match decode_message(&self.buffer) {
                    Ok(Some((message, used))) => {
                        self.buffer.drain(..used);
                        if self.handle_message(server, &expect, message) {
                            return;
                        }
                        if self.dead {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        error!("undecodable data on engine pipe, dropping buffer");
                        self.buffer.clear();
                        break;
                    }
                }
            }

            let n = match self.stdout.read(&mut chunk) {
                Ok(0) | Err(_) => {
                    warn!("engine pipe closed while waiting; is the engine process dead?");
                    self.dead = true;
                    return;
                }
                Ok(n) => n,
            };
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Returns true when `message` is the one the caller was waiting for.
    fn handle_message(
        &mut self,
        server: &Arc<Server>,
        expect: &WaitFor<'_>,
        message: RpcMessage,
    ) -> bool {
        match message {
            RpcMessage::Response { id, .. } => {
                // the result itself is never consumed
                matches!(expect, WaitFor::Response(expected, _) if *expected == id)
            }
            RpcMessage::Error { id, error } => {
                warn!(
                    "RPC call failed! id={id:?} ec={} msg={}",
                    error.code, error.message
                );
                true
            }
            RpcMessage::Request { id, method, params } => {
                if let WaitFor::Notification(expected) = expect
                    && id.is_none()
                    && method == *expected
                {
                    return true;
                }

                if let Some(reply) = dispatchers::handle_request(server, id, &method, &params)
                    && (self.stdin.write_all(&reply).is_err() || self.stdin.flush().is_err())
                {
                    self.dead = true;
                }
                false
            }
        }
    }

    /// Wave goodbye and reap the child.
    pub fn bye(&mut self, server: &Arc<Server>) {
        if !self.alive() {
            return;
        }
        self.call(server, "bye", &[]);
        match self.child.wait() {
            Ok(status) => info!("engine process exited, status={status}"),
            Err(e) => error!("waitpid() error: {e}"),
        }
    }
}
