use crate::net::registry::MappingStore;
use crate::net::relay::Relay;
use crate::net::session::Session;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use argon::logging;
use mio::net::TcpListener;
use mio::{Events, Poll, PollOpt, Ready, Token};
use signal_hook::consts::{SIGHUP, SIGINT, SIGPIPE, SIGQUIT};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(0);
// Accept poll timeout, bounds the latency of observing the stop flag.
const ACCEPT_TIMEOUT: Duration = Duration::from_millis(50);
// Period of the live-session eviction scan.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the listener, the relay and the cleanup scan. `run` drives the
/// accept loop on the calling thread and spawns one worker per accepted
/// client for the handshake; established pairs live on the relay driver.
pub struct Supervisor {
    listener: TcpListener,
    poll: Poll,
    relay: Arc<Relay>,
    store: Arc<MappingStore>,
    stop: Arc<AtomicBool>,
    log: logging::Logger,
}

impl Supervisor {
    /// Binds the listener at `address` (`host:port`) and prepares the relay.
    pub fn new(
        address: &str,
        store: Arc<MappingStore>,
        log: &logging::Logger,
    ) -> NetworkResult<Supervisor> {
        let addr = resolve(address)?;
        let listener = TcpListener::bind(&addr)?;
        let poll = Poll::new()?;

        poll.register(&listener, LISTENER_TOKEN, Ready::readable(), PollOpt::level())?;

        let relay = Arc::new(Relay::new(log)?);

        logging::info!(log, "listening"; "address" => %listener.local_addr()?);

        Ok(Supervisor {
            listener,
            poll,
            relay,
            store,
            stop: Arc::new(AtomicBool::new(false)),
            log: log.new(logging::o!()),
        })
    }

    /// The address the listener is actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The flag that terminates `run` once raised.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Installs process signal handling: SIGINT and SIGQUIT raise the stop
    /// flag, SIGPIPE and SIGHUP are ignored.
    pub fn install_signals(&self) -> io::Result<()> {
        signal_hook::flag::register(SIGINT, self.stop.clone())?;
        signal_hook::flag::register(SIGQUIT, self.stop.clone())?;

        unsafe {
            signal_hook::low_level::register(SIGPIPE, || ())?;
            signal_hook::low_level::register(SIGHUP, || ())?;
        }

        Ok(())
    }

    /// Accepts clients until the stop flag is raised, then joins the relay
    /// driver and the cleanup scan. In-flight handshakes are allowed to
    /// finish; surviving pairs are torn down when the driver exits.
    pub fn run(&self) {
        let driver = {
            let relay = self.relay.clone();
            let stop = self.stop.clone();
            thread::Builder::new()
                .name("relay-driver".to_string())
                .spawn(move || relay.run(&stop))
                .expect("Error spawning relay driver")
        };

        let cleanup = {
            let store = self.store.clone();
            let relay = self.relay.clone();
            let stop = self.stop.clone();
            let log = self.log.new(logging::o!());
            thread::Builder::new()
                .name("cleanup".to_string())
                .spawn(move || cleanup_loop(&store, &relay, &stop, &log))
                .expect("Error spawning cleanup thread")
        };

        self.accept_loop();

        logging::info!(self.log, "doing final cleanup");
        driver.join().expect("Relay driver panicked");
        cleanup.join().expect("Cleanup thread panicked");
        logging::info!(self.log, "cleanup finished, quitting");
    }

    fn accept_loop(&self) {
        let mut events = Events::with_capacity(64);

        while !self.stop.load(Ordering::Relaxed) {
            if let Err(err) = self.poll.poll(&mut events, Some(ACCEPT_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("Accept poll failed: {}", err);
            }

            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            for event in &events {
                if event.token() == LISTENER_TOKEN && event.readiness().is_readable() {
                    self.drain_accept();
                }
            }
        }
    }

    /// Accepts every pending connection and dispatches each to a handshake
    /// worker.
    fn drain_accept(&self) {
        loop {
            match self.listener.accept_std() {
                Ok((clnt, peer_addr)) => {
                    logging::info!(self.log, "got new client connection"; "peer" => %peer_addr);

                    let store = self.store.clone();
                    let relay = self.relay.clone();
                    let log = self.log.new(logging::o!());

                    let spawned = thread::Builder::new()
                        .name("session".to_string())
                        .spawn(move || Session::new(clnt, &log).run(&store, &relay));

                    if let Err(err) = spawned {
                        logging::error!(self.log, "failed to spawn session worker"; "error" => %err);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "failure accepting connection"; "error" => %err);
                    return;
                }
            }
        }
    }
}

fn cleanup_loop(
    store: &MappingStore,
    relay: &Relay,
    stop: &AtomicBool,
    log: &logging::Logger,
) {
    while !stop.load(Ordering::Relaxed) {
        relay.cleanup(&store.key_set());
        thread::sleep(CLEANUP_INTERVAL);
    }

    logging::debug!(log, "cleanup scan stopped");
}

fn resolve(address: &str) -> NetworkResult<SocketAddr> {
    address
        .to_socket_addrs()?
        .next()
        .ok_or(NetworkError::Fatal(ErrorType::AddrParse))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::registry::Mapping;
    use crate::net::session::{PROTOCOL_VERSION, SECURITY_NONE, SECURITY_VNC};
    use argon::crypto;
    use std::env;
    use std::fs;
    use std::io::{Read, Write};
    use std::net::{TcpListener as StdTcpListener, TcpStream};
    use std::path::PathBuf;
    use std::process;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    static STORE_SEQ: AtomicUsize = AtomicUsize::new(0);

    struct StoreFile(PathBuf);

    impl StoreFile {
        fn new() -> StoreFile {
            let seq = STORE_SEQ.fetch_add(1, Ordering::SeqCst);
            StoreFile(env::temp_dir().join(format!(
                "conduit-supervisor-test-{}-{}.json",
                process::id(),
                seq
            )))
        }
    }

    impl Drop for StoreFile {
        fn drop(&mut self) {
            drop(fs::remove_file(&self.0));
        }
    }

    fn spawn_upstream_none() -> (SocketAddr, thread::JoinHandle<TcpStream>) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut remote, _) = listener.accept().unwrap();
            remote.set_read_timeout(Some(READ_TIMEOUT)).unwrap();

            remote.write_all(PROTOCOL_VERSION).unwrap();
            let mut version = [0u8; 12];
            remote.read_exact(&mut version).unwrap();

            remote.write_all(&[1, SECURITY_NONE]).unwrap();
            let mut choice = [0u8; 1];
            remote.read_exact(&mut choice).unwrap();

            remote.write_all(&[0, 0, 0, 0]).unwrap();
            remote
        });

        (addr, handle)
    }

    fn client_handshake(addr: SocketAddr, key: &str) -> TcpStream {
        let mut clnt = TcpStream::connect(addr).unwrap();
        clnt.set_read_timeout(Some(READ_TIMEOUT)).unwrap();

        let mut version = [0u8; 12];
        clnt.read_exact(&mut version).unwrap();
        clnt.write_all(PROTOCOL_VERSION).unwrap();

        let mut offer = [0u8; 2];
        clnt.read_exact(&mut offer).unwrap();
        assert_eq!(offer, [1, SECURITY_VNC]);
        clnt.write_all(&[SECURITY_VNC]).unwrap();

        let mut challenge = [0u8; crypto::CHALLENGE_SIZE];
        clnt.read_exact(&mut challenge).unwrap();
        clnt.write_all(&crypto::auth_response(key.as_bytes(), &challenge))
            .unwrap();

        clnt
    }

    #[test]
    fn test_end_to_end_through_acceptor() {
        let file = StoreFile::new();
        let store =
            Arc::new(MappingStore::open(&file.0, &logging::discard()).unwrap());

        let (upstream_addr, upstream) = spawn_upstream_none();
        store
            .insert(Mapping {
                forward_key: "pass".to_string(),
                dest_addr: upstream_addr.to_string(),
                dest_passwd: None,
            })
            .unwrap();

        let supervisor = Arc::new(
            Supervisor::new("127.0.0.1:0", store, &logging::discard()).unwrap(),
        );
        let proxy_addr = supervisor.local_addr().unwrap();
        let stop = supervisor.stop_flag();

        let runner = {
            let supervisor = supervisor.clone();
            thread::spawn(move || supervisor.run())
        };

        let mut clnt = client_handshake(proxy_addr, "pass");

        let mut result = [0u8; 4];
        clnt.read_exact(&mut result).unwrap();
        assert_eq!(result, [0, 0, 0, 0]);

        let mut remote = upstream.join().unwrap();
        remote.write_all(b"pixels").unwrap();

        let mut buf = [0u8; 6];
        clnt.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pixels");

        stop.store(true, Ordering::Relaxed);
        runner.join().unwrap();

        // Driver exit tears the established pair down.
        assert_eq!(supervisor.relay.live_pairs(), 0);
    }

    #[test]
    fn test_stop_flag_terminates_run_promptly() {
        let file = StoreFile::new();
        let store =
            Arc::new(MappingStore::open(&file.0, &logging::discard()).unwrap());

        let supervisor = Arc::new(
            Supervisor::new("127.0.0.1:0", store, &logging::discard()).unwrap(),
        );
        let stop = supervisor.stop_flag();

        let runner = {
            let supervisor = supervisor.clone();
            thread::spawn(move || supervisor.run())
        };

        let started = Instant::now();
        stop.store(true, Ordering::Relaxed);
        runner.join().unwrap();

        // Bounded by the poll timeouts and one cleanup tick.
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_resolve_rejects_garbage() {
        assert!(resolve("not an address").is_err());
        assert!(resolve("127.0.0.1:5900").is_ok());
    }
}
