use crate::net::registry::{Mapping, MappingStore};
use crate::net::relay::Relay;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use argon::crypto;
use argon::logging;
use argon::time;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use lazy_static::lazy_static;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::process;
use std::sync::Mutex;

/// The only protocol version the proxy speaks, on both sides.
pub const PROTOCOL_VERSION: &[u8; 12] = b"RFB 003.008\n";

pub const SECURITY_NONE: u8 = 1;
pub const SECURITY_VNC: u8 = 2;

const SECURITY_RESULT_FAILED: u32 = 1;

lazy_static! {
    // Challenge source for the whole process, seeded once from the PID and
    // the wall clock.
    static ref CHALLENGE_RNG: Mutex<StdRng> = Mutex::new(StdRng::seed_from_u64(
        u64::from(process::id()).wrapping_add(time::timestamp_secs())
    ));
}

/// Draws a fresh 16-byte auth challenge.
fn challenge_bytes() -> [u8; crypto::CHALLENGE_SIZE] {
    let mut challenge = [0u8; crypto::CHALLENGE_SIZE];

    CHALLENGE_RNG
        .lock()
        .expect("Challenge RNG lock poisoned")
        .fill_bytes(&mut challenge);

    challenge
}

/// Owns one client socket from accept until either the hand-off to the relay
/// or a failure. The handshake runs on a worker with blocking I/O; every
/// exchange is a sequence of exact reads and writes.
pub struct Session {
    clnt: TcpStream,
    log: logging::Logger,
}

impl Session {
    pub fn new(clnt: TcpStream, log: &logging::Logger) -> Session {
        Session {
            clnt,
            log: log.new(logging::o!()),
        }
    }

    /// Runs the double handshake to completion. On success the client and
    /// upstream sockets are owned by the relay; on failure both are closed
    /// on drop and the session is never registered with the live index.
    pub fn run(self, store: &MappingStore, relay: &Relay) {
        let log = self.log.clone();

        if let Err(err) = self.execute(store, relay) {
            logging::info!(log, "session ended before forwarding"; "error" => ?err);
        }
    }

    fn execute(mut self, store: &MappingStore, relay: &Relay) -> NetworkResult<()> {
        self.clnt.set_nonblocking(false)?;

        self.exchange_versions()?;
        self.offer_security()?;

        let challenge = challenge_bytes();
        let response = self.challenge_client(&challenge)?;

        let mapping = match Self::match_mapping(store.snapshot(), &challenge, &response) {
            Some(mapping) => mapping,
            None => return self.reject_client(),
        };

        logging::info!(self.log, "client authenticated";
                       "forward_key" => &mapping.forward_key,
                       "dest_addr" => &mapping.dest_addr);

        let remote = self.connect_upstream(&mapping)?;

        relay.tie(self.clnt, remote, &mapping.forward_key)
    }

    /// Greets the client with RFB 3.8 and requires the same version back.
    fn exchange_versions(&mut self) -> NetworkResult<()> {
        self.clnt.write_all(PROTOCOL_VERSION)?;

        let mut version = [0u8; 12];
        self.clnt.read_exact(&mut version)?;

        if &version != PROTOCOL_VERSION {
            let shown = String::from_utf8_lossy(&version);
            logging::info!(self.log, "client protocol not supported";
                           "version" => %shown.trim_end());
            return Err(NetworkError::Fatal(ErrorType::VersionMismatch));
        }

        Ok(())
    }

    /// Offers exactly one security type (VNC auth), which doubles as the
    /// redirect hint. The client's choice is read but not validated.
    fn offer_security(&mut self) -> NetworkResult<()> {
        self.clnt.write_all(&[1, SECURITY_VNC])?;

        let mut choice = [0u8; 1];
        self.clnt.read_exact(&mut choice)?;

        Ok(())
    }

    fn challenge_client(
        &mut self,
        challenge: &[u8; crypto::CHALLENGE_SIZE],
    ) -> NetworkResult<[u8; crypto::CHALLENGE_SIZE]> {
        self.clnt.write_all(challenge)?;

        let mut response = [0u8; crypto::CHALLENGE_SIZE];
        self.clnt.read_exact(&mut response)?;

        Ok(response)
    }

    /// Scans a registry snapshot for the mapping whose key produces the
    /// client's response for this challenge.
    fn match_mapping(
        snapshot: Vec<Mapping>,
        challenge: &[u8; crypto::CHALLENGE_SIZE],
        response: &[u8; crypto::CHALLENGE_SIZE],
    ) -> Option<Mapping> {
        snapshot.into_iter().find(|mapping| {
            crypto::auth_response(mapping.forward_key.as_bytes(), challenge) == *response
        })
    }

    fn reject_client(mut self) -> NetworkResult<()> {
        logging::info!(self.log, "client authentication failed");

        self.clnt.write_u32::<BigEndian>(SECURITY_RESULT_FAILED)?;

        Err(NetworkError::Fatal(ErrorType::AuthFailed))
    }

    /// Dials the mapping's upstream and completes the server-side handshake,
    /// preferring None auth and falling back to VNC auth with the mapping's
    /// stored password.
    ///
    /// The SecurityResult that follows is deliberately left on the wire: the
    /// client reads the upstream's authoritative verdict through the relay.
    fn connect_upstream(&mut self, mapping: &Mapping) -> NetworkResult<TcpStream> {
        let mut remote = match TcpStream::connect(&mapping.dest_addr) {
            Ok(remote) => remote,
            Err(err) => {
                logging::error!(self.log, "error connecting to remote server";
                                "dest_addr" => &mapping.dest_addr,
                                "error" => %err);
                return Err(NetworkError::Fatal(ErrorType::DialFailed));
            }
        };

        let mut version = [0u8; 12];
        remote.read_exact(&mut version)?;

        if &version != PROTOCOL_VERSION {
            let shown = String::from_utf8_lossy(&version);
            logging::error!(self.log, "remote protocol not supported";
                            "dest_addr" => &mapping.dest_addr,
                            "version" => %shown.trim_end());
            return Err(NetworkError::Fatal(ErrorType::VersionMismatch));
        }

        remote.write_all(PROTOCOL_VERSION)?;

        let type_cnt = remote.read_u8()? as usize;
        let mut types = vec![0u8; type_cnt];
        remote.read_exact(&mut types)?;

        if types.contains(&SECURITY_NONE) {
            remote.write_all(&[SECURITY_NONE])?;
        } else {
            match &mapping.dest_passwd {
                Some(passwd) if types.contains(&SECURITY_VNC) => {
                    remote.write_all(&[SECURITY_VNC])?;

                    let mut upstream_challenge = [0u8; crypto::CHALLENGE_SIZE];
                    remote.read_exact(&mut upstream_challenge)?;

                    let response = crypto::auth_response(passwd.as_bytes(), &upstream_challenge);
                    remote.write_all(&response)?;
                }
                _ => {
                    logging::error!(self.log, "remote server authentication methods not supported";
                                    "dest_addr" => &mapping.dest_addr);
                    return Err(NetworkError::Fatal(ErrorType::SecurityUnsupported));
                }
            }
        }

        Ok(remote)
    }
}
