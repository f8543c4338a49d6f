use crate::net::buffer::Buffer;
use crate::net::support::NetworkResult;
use argon::logging;
use hashbrown::{HashMap, HashSet};
use mio::event::Event;
use mio::net::TcpStream;
use mio::unix::UnixReady;
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io::{self, Read, Write};
use std::net;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// Per-wakeup transfer chunk.
const CHUNK_SIZE: usize = 8192;
// Queued bytes above which the filling side stops being read (backpressure).
const QUEUE_SOFT_CAP: usize = 256 * 1024;
// Poll timeout, bounds the latency of observing the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One half of a forwarding pair. Everything read from its socket is queued
/// on the peer; everything queued on it is drained into its socket.
struct EndPoint {
    stream: TcpStream,
    token: Token,
    peer: Token,
    leader: bool,
    forward_key: Option<String>,
    queue: Buffer,
    enabled: AtomicBool,
    interest: Mutex<Ready>,
}

impl EndPoint {
    fn new(stream: TcpStream, token: Token, peer: Token, forward_key: Option<String>) -> EndPoint {
        EndPoint {
            stream,
            token,
            peer,
            leader: forward_key.is_some(),
            forward_key,
            queue: Buffer::new(),
            enabled: AtomicBool::new(false),
            interest: Mutex::new(Ready::readable()),
        }
    }
}

/// Drives every established forwarding pair over one readiness loop and owns
/// the live-session index used to evict sessions whose mapping disappeared.
///
/// Session workers call `tie` concurrently with the driver thread running
/// `run`; the cleanup thread calls `cleanup`. The endpoint table and the
/// leader index are each guarded by their own lock, taken briefly and never
/// across socket I/O.
pub struct Relay {
    poll: Poll,
    endpoints: Mutex<HashMap<Token, Arc<EndPoint>>>,
    leaders: Mutex<HashMap<String, Vec<Token>>>,
    next_token: AtomicUsize,
    log: logging::Logger,
}

impl Relay {
    pub fn new(log: &logging::Logger) -> NetworkResult<Relay> {
        Ok(Relay {
            poll: Poll::new()?,
            endpoints: Mutex::new(HashMap::new()),
            leaders: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
            log: log.new(logging::o!()),
        })
    }

    /// Ties a client socket and an upstream socket into a forwarding pair.
    ///
    /// Both sockets are moved into non-blocking mode, registered with the
    /// poll and marked enabled as one operation; the client half is the
    /// leader and is indexed under `forward_key` for cleanup eviction.
    pub fn tie(
        &self,
        clnt: net::TcpStream,
        remote: net::TcpStream,
        forward_key: &str,
    ) -> NetworkResult<()> {
        clnt.set_nonblocking(true)?;
        remote.set_nonblocking(true)?;

        let clnt = TcpStream::from_stream(clnt)?;
        let remote = TcpStream::from_stream(remote)?;

        let clnt_token = self.allocate_token();
        let remote_token = self.allocate_token();

        let leader = Arc::new(EndPoint::new(
            clnt,
            clnt_token,
            remote_token,
            Some(forward_key.to_string()),
        ));
        let follower = Arc::new(EndPoint::new(remote, remote_token, clnt_token, None));

        {
            let mut endpoints = self.lock_endpoints();
            endpoints.insert(clnt_token, leader.clone());
            endpoints.insert(remote_token, follower.clone());
        }

        {
            let mut leaders = self.lock_leaders();
            leaders
                .entry(forward_key.to_string())
                .or_insert_with(Vec::new)
                .push(clnt_token);
        }

        if let Err(err) = self.register(&leader).and_then(|_| self.register(&follower)) {
            self.shutdown_pair(&leader);
            return Err(err);
        }

        leader.enabled.store(true, Ordering::Release);
        follower.enabled.store(true, Ordering::Release);

        logging::info!(self.log, "forwarding established";
                       "forward_key" => forward_key,
                       "client_token" => clnt_token.0,
                       "remote_token" => remote_token.0);

        Ok(())
    }

    /// Runs the readiness loop until the stop flag is raised, then tears
    /// down every surviving pair.
    pub fn run(&self, stop: &AtomicBool) {
        let mut events = Events::with_capacity(1024);

        while !stop.load(Ordering::Relaxed) {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("Relay poll failed: {}", err);
            }

            for event in &events {
                self.dispatch(event);
            }
        }

        logging::debug!(self.log, "relay stopping"; "live_pairs" => self.live_pairs());
        self.teardown_all();
    }

    /// Shuts down every live pair whose forward key is absent from the
    /// supplied set of valid keys.
    pub fn cleanup(&self, valid_keys: &HashSet<String>) {
        let doomed: Vec<Token> = {
            let leaders = self.lock_leaders();
            leaders
                .iter()
                .filter(|(key, _)| !valid_keys.contains(key.as_str()))
                .flat_map(|(_, tokens)| tokens.iter().copied())
                .collect()
        };

        for token in doomed {
            if let Some(leader) = self.get(token) {
                logging::info!(self.log, "evicting session, mapping removed";
                               "forward_key" => leader.forward_key.as_deref().unwrap_or(""),
                               "client_token" => token.0);
                self.shutdown_pair(&leader);
            }
        }
    }

    /// The number of live forwarding pairs.
    pub fn live_pairs(&self) -> usize {
        self.lock_endpoints()
            .values()
            .filter(|ep| ep.leader)
            .count()
    }

    fn dispatch(&self, event: Event) {
        let ep = match self.get(event.token()) {
            Some(ep) => ep,
            None => return,
        };

        let readiness = event.readiness();

        if readiness.is_readable() {
            self.handle_read(&ep);
        }
        if readiness.is_writable() {
            self.handle_write(&ep);
        }

        let unix_readiness = UnixReady::from(readiness);
        if unix_readiness.is_error() || unix_readiness.is_hup() {
            self.teardown(&ep);
        }
    }

    /// Moves available bytes from this endpoint's socket onto the peer's
    /// queue. A zero-length read or a hard error tears the pair down.
    fn handle_read(&self, ep: &Arc<EndPoint>) {
        if !ep.enabled.load(Ordering::Acquire) {
            return;
        }

        let peer = match self.get(ep.peer) {
            Some(peer) => peer,
            None => return,
        };

        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            match (&ep.stream).read(&mut chunk) {
                Ok(0) => {
                    self.teardown(ep);
                    return;
                }
                Ok(cnt) => {
                    peer.queue.append(&chunk[..cnt]);
                    self.interest_add(&peer, Ready::writable());

                    if peer.queue.len() >= QUEUE_SOFT_CAP {
                        // The peer is not draining; stop reading until it does.
                        self.interest_remove(ep, Ready::readable());
                        return;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.teardown(ep);
                    return;
                }
            }
        }
    }

    /// Drains this endpoint's queue into its socket. Once empty the write
    /// interest is dropped; once below the soft cap the peer resumes reading.
    fn handle_write(&self, ep: &Arc<EndPoint>) {
        if !ep.enabled.load(Ordering::Acquire) {
            return;
        }

        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            let cnt = ep.queue.peek(0, &mut chunk);
            if cnt == 0 {
                self.interest_remove(ep, Ready::writable());
                break;
            }

            match (&ep.stream).write(&chunk[..cnt]) {
                Ok(0) => {
                    self.teardown(ep);
                    return;
                }
                Ok(sent) => {
                    ep.queue.discard(sent);
                    if sent < cnt {
                        break;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.teardown(ep);
                    return;
                }
            }
        }

        if ep.queue.len() < QUEUE_SOFT_CAP {
            if let Some(peer) = self.get(ep.peer) {
                self.interest_add(&peer, Ready::readable());
            }
        }
    }

    /// Resolves the leader of the pair and runs the global teardown through
    /// it. Only the leader removes the pair from the live-session index.
    fn teardown(&self, ep: &Arc<EndPoint>) {
        if ep.leader {
            self.shutdown_pair(ep);
        } else {
            match self.get(ep.peer) {
                Some(leader) => self.shutdown_pair(&leader),
                None => {
                    self.shutdown_half(ep);
                }
            }
        }
    }

    fn shutdown_pair(&self, leader: &Arc<EndPoint>) {
        // The half that loses the removal race skips the global teardown, so
        // the pair is closed exactly once.
        if !self.shutdown_half(leader) {
            return;
        }

        if let Some(key) = &leader.forward_key {
            let mut leaders = self.lock_leaders();
            if let Some(tokens) = leaders.get_mut(key) {
                tokens.retain(|&token| token != leader.token);
                if tokens.is_empty() {
                    leaders.remove(key);
                }
            }
        }

        if let Some(peer) = self.get(leader.peer) {
            self.shutdown_half(&peer);
        }

        logging::info!(self.log, "forwarding shut down";
                       "client_token" => leader.token.0,
                       "remote_token" => leader.peer.0);
    }

    fn shutdown_half(&self, ep: &Arc<EndPoint>) -> bool {
        if self.lock_endpoints().remove(&ep.token).is_none() {
            return false;
        }

        ep.enabled.store(false, Ordering::Release);
        drop(self.poll.deregister(&ep.stream));
        drop(ep.stream.shutdown(Shutdown::Both));
        true
    }

    fn teardown_all(&self) {
        let survivors: Vec<Arc<EndPoint>> = {
            let endpoints = self.lock_endpoints();
            endpoints.values().filter(|ep| ep.leader).cloned().collect()
        };

        for leader in survivors {
            self.shutdown_pair(&leader);
        }

        // Halves whose leader was already gone.
        let strays: Vec<Arc<EndPoint>> =
            { self.lock_endpoints().values().cloned().collect() };
        for stray in strays {
            self.shutdown_half(&stray);
        }
    }

    fn register(&self, ep: &EndPoint) -> NetworkResult<()> {
        self.poll
            .register(&ep.stream, ep.token, Ready::readable(), PollOpt::level())
            .map_err(Into::into)
    }

    fn interest_add(&self, ep: &EndPoint, ready: Ready) {
        let mut interest = ep.interest.lock().expect("Endpoint interest lock poisoned");
        let mut updated = *interest;
        updated.insert(ready);

        if updated != *interest
            && self
                .poll
                .reregister(&ep.stream, ep.token, updated, PollOpt::level())
                .is_ok()
        {
            *interest = updated;
        }
    }

    fn interest_remove(&self, ep: &EndPoint, ready: Ready) {
        let mut interest = ep.interest.lock().expect("Endpoint interest lock poisoned");
        let mut updated = *interest;
        updated.remove(ready);

        if updated != *interest
            && self
                .poll
                .reregister(&ep.stream, ep.token, updated, PollOpt::level())
                .is_ok()
        {
            *interest = updated;
        }
    }

    #[inline]
    fn get(&self, token: Token) -> Option<Arc<EndPoint>> {
        self.lock_endpoints().get(&token).cloned()
    }

    #[inline]
    fn allocate_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    fn lock_endpoints(&self) -> MutexGuard<HashMap<Token, Arc<EndPoint>>> {
        self.endpoints.lock().expect("Endpoint table lock poisoned")
    }

    #[inline]
    fn lock_leaders(&self) -> MutexGuard<HashMap<String, Vec<Token>>> {
        self.leaders.lock().expect("Leader index lock poisoned")
    }
}
