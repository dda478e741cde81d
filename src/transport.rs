// SPDX-License-Identifier: Apache-2.0

//! Byte transports carrying TPM command and response packets.
//!
//! The dispatcher consumes a stream-oriented bidirectional interface: one
//! `write` submits a whole command, one `read` returns a whole response.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;

use crate::error::{Error, Result};

/// Maximum command/response size until the dispatcher learns otherwise
/// from the TPM's properties.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 4096;

/// A bidirectional channel to a TPM. Implementations deliver one whole
/// response per `read` call; they are not required to be line-oriented.
pub trait Transport {
    fn write(&mut self, data: &[u8]) -> Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn close(&mut self) -> Result<()>;
}

fn transport_err(op: &'static str) -> impl FnOnce(std::io::Error) -> Error {
    move |source| Error::Transport { op, source }
}

/// A Linux TPM character device (`/dev/tpmrm0` or `/dev/tpm0`). The
/// in-kernel resource manager device is preferred because it virtualizes
/// handles and sessions between clients.
pub struct LinuxDevice {
    file: File,
    path: String,
}

impl LinuxDevice {
    /// Open a specific TPM character device.
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(transport_err("open"))?;
        tracing::debug!(path, "opened TPM device");
        Ok(Self {
            file,
            path: path.to_string(),
        })
    }

    /// Open the first available TPM device.
    pub fn detect() -> Result<Self> {
        for candidate in ["/dev/tpmrm0", "/dev/tpm0"] {
            if Path::new(candidate).exists() {
                return Self::open(candidate);
            }
        }
        Err(Error::Transport {
            op: "open",
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no TPM device found"),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Transport for LinuxDevice {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.file.write_all(data).map_err(transport_err("write"))?;
        tracing::trace!(len = data.len(), "wrote command");
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.file.read(buf).map_err(transport_err("read"))?;
        tracing::trace!(len = n, "read response");
        Ok(n)
    }

    fn close(&mut self) -> Result<()> {
        // dropping the file descriptor closes the device
        Ok(())
    }
}

// Platform and command port opcodes of the Microsoft TPM 2.0 simulator.
const MSSIM_POWER_ON: u32 = 1;
const MSSIM_TPM_SEND_COMMAND: u32 = 8;
const MSSIM_NV_ON: u32 = 11;
const MSSIM_SESSION_END: u32 = 20;

/// A connection to the Microsoft TPM 2.0 simulator: a command port plus a
/// platform port one above it.
pub struct MssimTransport {
    command: TcpStream,
    platform: TcpStream,
    locality: u8,
}

impl MssimTransport {
    /// Connect to a simulator and bring it up (power on, NV on).
    pub fn connect(host: &str, command_port: u16) -> Result<Self> {
        let command =
            TcpStream::connect((host, command_port)).map_err(transport_err("connect"))?;
        let platform =
            TcpStream::connect((host, command_port + 1)).map_err(transport_err("connect"))?;

        let mut transport = Self {
            command,
            platform,
            locality: 0,
        };
        transport.platform_command(MSSIM_POWER_ON)?;
        transport.platform_command(MSSIM_NV_ON)?;
        tracing::debug!(host, command_port, "connected to mssim");
        Ok(transport)
    }

    fn platform_command(&mut self, code: u32) -> Result<()> {
        self.platform
            .write_all(&code.to_be_bytes())
            .map_err(transport_err("write"))?;
        let mut ack = [0u8; 4];
        self.platform
            .read_exact(&mut ack)
            .map_err(transport_err("read"))?;
        if u32::from_be_bytes(ack) != 0 {
            return Err(Error::Transport {
                op: "platform",
                source: std::io::Error::other(format!(
                    "platform command {} failed with 0x{:08x}",
                    code,
                    u32::from_be_bytes(ack)
                )),
            });
        }
        Ok(())
    }
}

impl Transport for MssimTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut framed = Vec::with_capacity(data.len() + 9);
        framed.extend_from_slice(&MSSIM_TPM_SEND_COMMAND.to_be_bytes());
        framed.push(self.locality);
        framed.extend_from_slice(&(data.len() as u32).to_be_bytes());
        framed.extend_from_slice(data);
        self.command
            .write_all(&framed)
            .map_err(transport_err("write"))?;
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut len_bytes = [0u8; 4];
        self.command
            .read_exact(&mut len_bytes)
            .map_err(transport_err("read"))?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > buf.len() {
            return Err(Error::Transport {
                op: "read",
                source: std::io::Error::other(format!(
                    "response of {} bytes exceeds the {} byte buffer",
                    len,
                    buf.len()
                )),
            });
        }
        self.command
            .read_exact(&mut buf[..len])
            .map_err(transport_err("read"))?;

        // the simulator appends a u32 completion code to every response
        let mut trailer = [0u8; 4];
        self.command
            .read_exact(&mut trailer)
            .map_err(transport_err("read"))?;
        Ok(len)
    }

    fn close(&mut self) -> Result<()> {
        let _ = self.command.write_all(&MSSIM_SESSION_END.to_be_bytes());
        let _ = self.platform.write_all(&MSSIM_SESSION_END.to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted in-memory transport: parses each written command packet
    //! and asks a handler closure to produce the response, recording the
    //! command-code log.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::constants::TpmCc;

    pub type CommandLog = Arc<Mutex<Vec<TpmCc>>>;

    pub struct ScriptedTransport {
        handler: Box<dyn FnMut(TpmCc, &[u8]) -> Vec<u8> + Send>,
        log: CommandLog,
        pending: VecDeque<Vec<u8>>,
    }

    impl ScriptedTransport {
        pub fn new<F>(handler: F) -> (Self, CommandLog)
        where
            F: FnMut(TpmCc, &[u8]) -> Vec<u8> + Send + 'static,
        {
            let log: CommandLog = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    handler: Box::new(handler),
                    log: log.clone(),
                    pending: VecDeque::new(),
                },
                log,
            )
        }
    }

    impl Transport for ScriptedTransport {
        fn write(&mut self, data: &[u8]) -> Result<usize> {
            assert!(data.len() >= 10, "command packet too short");
            let cc_raw = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
            let cc = TpmCc::from_u32(cc_raw).expect("unknown command code in test");
            self.log.lock().unwrap().push(cc);
            let response = (self.handler)(cc, data);
            self.pending.push_back(response);
            Ok(data.len())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let response = self.pending.pop_front().expect("no pending response");
            buf[..response.len()].copy_from_slice(&response);
            Ok(response.len())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
