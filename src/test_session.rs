//! TWAMP-Test exchange for one accepted session.
//!
//! The sender transmits `packets` probes on a fixed schedule and matches the
//! reflections against what is still outstanding. Loss, duplication and
//! reordering are recorded in the outcome; none of them is an error.

use std::{
    collections::{BTreeMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    error_estimate::ErrorEstimate,
    messages::SessionId,
    packets::{ReflectedTestPacket, TestPacket, TEST_PACKET_SIZE},
    security::TestCipher,
    time::{duration_between, Clock, Timestamp},
    transport::DatagramTransport,
};

/// Everything agreed for one test session during the control exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionParameters {
    /// Local Session-Sender endpoint.
    pub sender: SocketAddr,
    /// Session-Reflector endpoint, with the port the server accepted.
    pub receiver: SocketAddr,
    pub packets: u32,
    pub padding_length: u32,
    pub start_time: Timestamp,
    /// How long to wait for a reflection before a packet counts as lost.
    pub timeout: Duration,
    /// SID proposed in Request-TW-Session.
    #[serde(serialize_with = "serialize_sid")]
    pub client_sid: SessionId,
    /// SID assigned in Accept-Session.
    #[serde(serialize_with = "serialize_sid")]
    pub server_sid: SessionId,
    pub reflector_port: u16,
    pub type_p: u32,
}

fn serialize_sid<S: serde::Serializer>(sid: &SessionId, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(sid))
}

/// Local sending behaviour, not negotiated with the server.
#[derive(Debug, Clone, Copy)]
pub struct TestOptions {
    pub interval: Duration,
    pub error_estimate: ErrorEstimate,
}

/// One matched probe with its four timestamps.
///
/// T1 is the local send time, T2/T3 the reflector's receive/send times and T4
/// the local receive time. Delays are in nanoseconds; one-way values are only
/// meaningful when both clocks are synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResultRow {
    /// 1-based position among the matched rows.
    pub sequence: u64,
    pub sender_sequence: u32,
    pub reflector_sequence: u32,
    pub t1: Timestamp,
    pub t2: Timestamp,
    pub t3: Timestamp,
    pub t4: Timestamp,
    pub sender_ttl: u8,
    pub sender_error_estimate: ErrorEstimate,
    pub reflector_error_estimate: ErrorEstimate,
    pub round_trip_ns: i64,
    pub forward_ns: i64,
    pub backward_ns: i64,
    pub reflector_delay_ns: i64,
}

impl TestResultRow {
    /// `t1` is the send time recorded locally; the reflector's echo of it is ignored.
    fn new(
        sender_sequence: u32,
        t1: Timestamp,
        t4: Timestamp,
        reflected: &ReflectedTestPacket,
    ) -> Self {
        let t2 = reflected.receive_timestamp;
        let t3 = reflected.timestamp;
        let nanos = |a, b| {
            duration_between(a, b)
                .num_nanoseconds()
                .unwrap_or_default()
        };
        let reflector_delay_ns = nanos(t2, t3);

        TestResultRow {
            sequence: 0,
            sender_sequence,
            reflector_sequence: reflected.sequence_number,
            t1,
            t2,
            t3,
            t4,
            sender_ttl: reflected.sess_sender_ttl,
            sender_error_estimate: reflected.sess_sender_err_estimate.into(),
            reflector_error_estimate: reflected.error_estimate.into(),
            round_trip_ns: nanos(t1, t4) - reflector_delay_ns,
            forward_ns: nanos(t1, t2),
            backward_ns: nanos(t3, t4),
            reflector_delay_ns,
        }
    }
}

/// Per-session counters of everything that was not a clean match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TestCounters {
    pub sent: u32,
    /// Sends that left more than one interval after their slot.
    pub late_sends: u32,
    pub send_errors: u32,
    pub received: u32,
    /// Reflections for a sequence number never sent.
    pub unmatched: u32,
    pub duplicates: u32,
    /// Reflections arriving after their packet was declared lost.
    pub late_reflections: u32,
    /// Datagrams that did not decode as a reflected packet.
    pub malformed: u32,
}

/// Result of one test session.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub session: SessionParameters,
    pub rows: Vec<TestResultRow>,
    /// Sender sequence numbers never reflected in time, ascending.
    pub lost: Vec<u32>,
    pub counters: TestCounters,
    pub cancelled: bool,
}

struct Pending {
    sent_at: Timestamp,
    deadline: Instant,
}

/// Sender side of one TWAMP-Test session.
pub struct TestSession<D: DatagramTransport> {
    params: SessionParameters,
    options: TestOptions,
    transport: D,
    cipher: TestCipher,
    clock: Arc<dyn Clock>,
    pending: BTreeMap<u32, Pending>,
    matched: HashSet<u32>,
    lost: HashSet<u32>,
    rows: Vec<TestResultRow>,
    counters: TestCounters,
}

impl<D: DatagramTransport> TestSession<D> {
    pub fn new(
        params: SessionParameters,
        options: TestOptions,
        transport: D,
        cipher: TestCipher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        TestSession {
            params,
            options,
            transport,
            cipher,
            clock,
            pending: BTreeMap::new(),
            matched: HashSet::new(),
            lost: HashSet::new(),
            rows: Vec::new(),
            counters: TestCounters::default(),
        }
    }

    /// Runs the exchange until every packet is matched or lost, `timeout` has
    /// passed since the last send, or `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> TestOutcome {
        let first_slot = self.first_slot();
        let interval = self.options.interval;
        let total = self.params.packets;
        let mut next_seq: u32 = 0;
        let mut last_send: Option<Instant> = None;
        let mut cancelled = false;
        let mut recv_buf = [0u8; 2048];

        info!(
            "Test session {} to {}: {} packets every {:?}",
            hex::encode(self.params.server_sid),
            self.params.receiver,
            total,
            interval
        );

        loop {
            let now = Instant::now();
            self.expire(now);

            if next_seq == total {
                if self.pending.is_empty() {
                    break;
                }
                if last_send.is_some_and(|t| now >= t + self.params.timeout) {
                    break;
                }
            }

            let slot = (next_seq < total).then(|| first_slot + interval * next_seq);
            if let Some(slot) = slot.filter(|s| now >= *s) {
                if now > slot + interval {
                    self.counters.late_sends += 1;
                }
                self.send(next_seq).await;
                last_send = Some(Instant::now());
                next_seq += 1;
                continue;
            }

            let mut wake = slot
                .or(last_send.map(|t| t + self.params.timeout))
                .unwrap_or(now + self.params.timeout);
            if let Some(p) = self.pending.values().next() {
                wake = wake.min(p.deadline);
            }

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                r = self.transport.receive_datagram(&mut recv_buf, wake) => r,
            };

            match received {
                Ok(Some(len)) => {
                    let t4 = self.clock.now();
                    self.handle_reflection(&recv_buf[..len], t4);
                }
                Ok(None) => {}
                Err(e) => warn!("Receive error on test session: {}", e),
            }
        }

        self.finish(cancelled)
    }

    fn first_slot(&self) -> Instant {
        let now = Instant::now();
        // zero means "as soon as possible"
        if self.params.start_time == Timestamp::default() {
            return now;
        }
        let ahead = duration_between(self.clock.now(), self.params.start_time);
        match ahead.to_std() {
            Ok(delay) => now + delay,
            // start time already passed
            Err(_) => now,
        }
    }

    async fn send(&mut self, seq: u32) {
        let sent_at = self.clock.now();
        let packet = TestPacket {
            sequence_number: seq,
            timestamp: sent_at,
            error_estimate: self.options.error_estimate.to_wire(),
            ..Default::default()
        };
        let mut buf = packet.to_bytes();
        self.cipher.encrypt(&mut buf);

        match self.transport.send_datagram(&buf).await {
            Ok(_) => {
                self.counters.sent += 1;
                self.pending.insert(
                    seq,
                    Pending {
                        sent_at,
                        deadline: Instant::now() + self.params.timeout,
                    },
                );
            }
            Err(e) => {
                warn!("Failed to send packet {}: {}", seq, e);
                self.counters.send_errors += 1;
                self.lost.insert(seq);
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(entry) = self.pending.first_entry() {
            if entry.get().deadline > now {
                break;
            }
            let seq = *entry.key();
            entry.remove();
            debug!("Packet {} lost", seq);
            self.lost.insert(seq);
        }
    }

    fn handle_reflection(&mut self, data: &[u8], t4: Timestamp) {
        self.counters.received += 1;

        let Ok(mut buf) = <[u8; TEST_PACKET_SIZE]>::try_from(data) else {
            debug!("Dropping {}-byte datagram", data.len());
            self.counters.malformed += 1;
            return;
        };
        self.cipher.decrypt(&mut buf);
        let reflected = match ReflectedTestPacket::from_bytes(&buf) {
            Ok(p) => p,
            Err(e) => {
                debug!("Dropping reflection: {}", e);
                self.counters.malformed += 1;
                return;
            }
        };

        let seq = reflected.sess_sender_seq_number;
        if let Some(pending) = self.pending.remove(&seq) {
            self.matched.insert(seq);
            self.rows
                .push(TestResultRow::new(seq, pending.sent_at, t4, &reflected));
        } else if self.matched.contains(&seq) {
            self.counters.duplicates += 1;
        } else if self.lost.contains(&seq) {
            self.counters.late_reflections += 1;
        } else {
            self.counters.unmatched += 1;
        }
    }

    fn finish(mut self, cancelled: bool) -> TestOutcome {
        self.lost.extend(self.pending.keys().copied());
        let mut lost: Vec<u32> = self.lost.into_iter().collect();
        lost.sort_unstable();

        self.rows.sort_by_key(|r| r.sender_sequence);
        for (i, row) in self.rows.iter_mut().enumerate() {
            row.sequence = i as u64 + 1;
        }

        info!(
            "Test session {} done: {} matched, {} lost{}",
            hex::encode(self.params.server_sid),
            self.rows.len(),
            lost.len(),
            if cancelled { " (cancelled)" } else { "" }
        );

        TestOutcome {
            session: self.params,
            rows: self.rows,
            lost,
            counters: self.counters,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;
    use async_trait::async_trait;
    use std::io;
    use tokio::sync::{mpsc, Mutex};

    /// Datagram endpoint backed by channels; the reflector task holds the other ends.
    struct ChannelTransport {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    #[async_trait]
    impl DatagramTransport for ChannelTransport {
        async fn send_datagram(&self, data: &[u8]) -> io::Result<usize> {
            self.tx
                .send(data.to_vec())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            Ok(data.len())
        }

        async fn receive_datagram(
            &self,
            buf: &mut [u8],
            deadline: Instant,
        ) -> io::Result<Option<usize>> {
            let mut rx = self.rx.lock().await;
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(Some(data.len()))
                }
                Ok(None) => Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
                Err(_) => Ok(None),
            }
        }
    }

    /// Spawns a reflector that answers through `behaviour`, which returns the
    /// datagrams to send back for each probe.
    fn reflector<F>(cipher: TestCipher, mut behaviour: F) -> ChannelTransport
    where
        F: FnMut(u32, Vec<u8>) -> Vec<Vec<u8>> + Send + 'static,
    {
        let (to_reflector, mut from_sender) = mpsc::unbounded_channel::<Vec<u8>>();
        let (to_sender, from_reflector) = mpsc::unbounded_channel();
        let clock = SystemClock::new();

        tokio::spawn(async move {
            let mut reflected_seq = 0;
            while let Some(data) = from_sender.recv().await {
                let mut buf: [u8; TEST_PACKET_SIZE] = data.try_into().unwrap();
                cipher.decrypt(&mut buf);
                let probe = TestPacket::from_bytes(&buf).unwrap();
                let t2 = clock.now();
                let reply = ReflectedTestPacket::reflect(&probe, reflected_seq, t2, clock.now(), 255);
                reflected_seq += 1;
                let mut out = reply.to_bytes();
                cipher.encrypt(&mut out);
                for datagram in behaviour(probe.sequence_number, out.to_vec()) {
                    let _ = to_sender.send(datagram);
                }
            }
        });

        ChannelTransport {
            tx: to_reflector,
            rx: Mutex::new(from_reflector),
        }
    }

    fn params(packets: u32, timeout: Duration) -> SessionParameters {
        SessionParameters {
            sender: "127.0.0.1:20000".parse().unwrap(),
            receiver: "127.0.0.1:20001".parse().unwrap(),
            packets,
            padding_length: 114,
            start_time: SystemClock::new().now(),
            timeout,
            client_sid: [1; 16],
            server_sid: [2; 16],
            reflector_port: 20001,
            type_p: 0,
        }
    }

    fn options() -> TestOptions {
        TestOptions {
            interval: Duration::from_millis(5),
            error_estimate: ErrorEstimate::unsynchronized(),
        }
    }

    async fn run_session<F>(
        session_params: SessionParameters,
        cipher: TestCipher,
        behaviour: F,
    ) -> TestOutcome
    where
        F: FnMut(u32, Vec<u8>) -> Vec<Vec<u8>> + Send + 'static,
    {
        let transport = reflector(cipher.clone(), behaviour);
        let session = TestSession::new(
            session_params,
            options(),
            transport,
            cipher,
            Arc::new(SystemClock::new()),
        );
        session.run(CancellationToken::new()).await
    }

    async fn run_with<F>(packets: u32, cipher: TestCipher, behaviour: F) -> TestOutcome
    where
        F: FnMut(u32, Vec<u8>) -> Vec<Vec<u8>> + Send + 'static,
    {
        run_session(params(packets, Duration::from_millis(300)), cipher, behaviour).await
    }

    #[tokio::test]
    async fn test_drops_are_recorded_as_loss() {
        // packets 6 and 7 (sequence numbers 5 and 6) never come back
        let outcome = run_with(10, TestCipher::Clear, |seq, reply| {
            if seq == 5 || seq == 6 {
                vec![]
            } else {
                vec![reply]
            }
        })
        .await;

        assert_eq!(outcome.rows.len(), 8);
        assert_eq!(outcome.lost, vec![5, 6]);
        assert_eq!(outcome.counters.sent, 10);
        assert!(!outcome.cancelled);

        let sequences: Vec<u64> = outcome.rows.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, (1..=8).collect::<Vec<u64>>());
        let senders: Vec<u32> = outcome.rows.iter().map(|r| r.sender_sequence).collect();
        assert_eq!(senders, vec![0, 1, 2, 3, 4, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_duplicates_and_garbage_are_counted() {
        let outcome = run_with(4, TestCipher::Clear, |seq, reply| match seq {
            1 => vec![reply.clone(), reply],
            2 => vec![vec![0u8; 40], reply],
            _ => vec![reply],
        })
        .await;

        assert_eq!(outcome.rows.len(), 4);
        assert!(outcome.lost.is_empty());
        assert_eq!(outcome.counters.duplicates, 1);
        assert_eq!(outcome.counters.malformed, 1);
        assert_eq!(outcome.counters.received, 6);
    }

    #[tokio::test]
    async fn test_unknown_sequence_is_unmatched() {
        let outcome = run_with(2, TestCipher::Clear, |seq, reply| {
            let mut bogus = ReflectedTestPacket::from_bytes(&reply).unwrap();
            bogus.sess_sender_seq_number = 1000 + seq;
            vec![bogus.to_bytes().to_vec(), reply]
        })
        .await;

        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.counters.unmatched, 2);
    }

    #[tokio::test]
    async fn test_reordered_reflections_still_sort_by_sender_sequence() {
        let mut held: Option<Vec<u8>> = None;
        let outcome = run_with(4, TestCipher::Clear, move |seq, reply| {
            if seq == 1 {
                held = Some(reply);
                vec![]
            } else if seq == 2 {
                vec![reply, held.take().unwrap()]
            } else {
                vec![reply]
            }
        })
        .await;

        let senders: Vec<u32> = outcome.rows.iter().map(|r| r.sender_sequence).collect();
        assert_eq!(senders, vec![0, 1, 2, 3]);
        assert_eq!(outcome.rows[3].sequence, 4);
    }

    #[tokio::test]
    async fn test_encrypted_exchange_matches() {
        let cipher = TestCipher::Encrypted { key: [0x3C; 16] };
        let outcome = run_with(3, cipher, |_, reply| vec![reply]).await;
        assert_eq!(outcome.rows.len(), 3);
        assert_eq!(outcome.counters.malformed, 0);
    }

    #[tokio::test]
    async fn test_delays_are_consistent() {
        let outcome = run_with(1, TestCipher::Clear, |_, reply| vec![reply]).await;
        let row = &outcome.rows[0];
        assert_eq!(row.sender_ttl, 255);
        assert!(row.reflector_delay_ns >= 0);
        // round trip excludes reflector residence time; conversions may round apart
        assert!((row.round_trip_ns - (row.forward_ns + row.backward_ns)).abs() <= 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_session() {
        let transport = reflector(TestCipher::Clear, |_, _| vec![]);
        let session = TestSession::new(
            params(1000, Duration::from_secs(5)),
            TestOptions {
                interval: Duration::from_millis(50),
                ..options()
            },
            transport,
            TestCipher::Clear,
            Arc::new(SystemClock::new()),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(2), session.run(cancel))
            .await
            .expect("cancel ends the run");
        assert!(outcome.cancelled);
        assert!(outcome.counters.sent < 1000);
        assert_eq!(outcome.lost.len() as u32, outcome.counters.sent);
    }

    #[tokio::test]
    async fn test_delays_use_local_send_time() {
        // a reflector that mangles the echoed send timestamp
        let outcome = run_with(3, TestCipher::Clear, |_, reply| {
            let mut mangled = ReflectedTestPacket::from_bytes(&reply).unwrap();
            mangled.sess_sender_timestamp = Timestamp(0);
            vec![mangled.to_bytes().to_vec()]
        })
        .await;

        assert_eq!(outcome.rows.len(), 3);
        for row in &outcome.rows {
            assert_ne!(row.t1, Timestamp(0));
            assert!(row.t1 <= row.t4);
            assert!(row.round_trip_ns >= 0);
            assert!(row.round_trip_ns < 1_000_000_000);
        }
    }

    #[tokio::test]
    async fn test_zero_or_past_start_time_starts_at_once() {
        let now = SystemClock::new().now();
        let ten_seconds_ago = Timestamp(now.0 - (10u64 << 32));
        for start_time in [Timestamp::default(), ten_seconds_ago] {
            let late = SessionParameters {
                start_time,
                ..params(3, Duration::from_millis(300))
            };
            let outcome = tokio::time::timeout(
                Duration::from_secs(2),
                run_session(late, TestCipher::Clear, |_, reply| vec![reply]),
            )
            .await
            .expect("session starts without waiting");
            assert_eq!(outcome.rows.len(), 3);
        }
    }
}
