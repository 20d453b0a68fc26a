//! Client run: control connection, test sockets, concurrent test sessions.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use log::{info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    net::{TcpSocket, TcpStream, UdpSocket},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    configuration::{Configuration, ConfigurationError, OutputFormat},
    control::{ControlSession, SessionRequest},
    error::TwampError,
    messages::type_p_from_dscp,
    modes::Mode,
    test_session::{SessionParameters, TestOutcome, TestSession},
    time::{Clock, SystemClock, Timestamp},
    transport::ControlTransport,
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Twamp(#[from] TwampError),
}

/// Everything measured in one client run.
#[derive(Debug, Serialize)]
pub struct ClientReport {
    pub server: SocketAddr,
    pub mode: Mode,
    pub server_start_time: Option<Timestamp>,
    pub sessions: Vec<TestOutcome>,
}

impl ClientReport {
    /// Prints the report in the given format.
    pub fn print(&self, format: OutputFormat) {
        match format {
            OutputFormat::Text => self.print_text(),
            OutputFormat::Json => self.print_json(),
        }
    }

    fn print_text(&self) {
        println!("\n--- TWAMP results from {} (mode {}) ---", self.server, self.mode);
        for outcome in &self.sessions {
            let s = &outcome.session;
            let c = &outcome.counters;
            println!(
                "\nSession {} -> {}{}",
                hex::encode(s.server_sid),
                s.receiver,
                if outcome.cancelled { " (cancelled)" } else { "" }
            );
            println!(
                "Packets sent: {}, matched: {}, lost: {}",
                c.sent,
                outcome.rows.len(),
                outcome.lost.len()
            );
            let anomalies = c.late_sends
                + c.send_errors
                + c.unmatched
                + c.duplicates
                + c.malformed
                + c.late_reflections;
            if anomalies > 0 {
                println!(
                    "Late sends: {}, send errors: {}, unmatched: {}, duplicates: {}, \
                     malformed: {}, late: {}",
                    c.late_sends,
                    c.send_errors,
                    c.unmatched,
                    c.duplicates,
                    c.malformed,
                    c.late_reflections
                );
            }
            println!(
                "{:>6} {:>8} {:>12} {:>12} {:>12} {:>12} {:>4}",
                "seq", "sender", "rtt_ms", "fwd_ms", "bwd_ms", "refl_ms", "ttl"
            );
            for row in &outcome.rows {
                println!(
                    "{:>6} {:>8} {:>12.3} {:>12.3} {:>12.3} {:>12.3} {:>4}",
                    row.sequence,
                    row.sender_sequence,
                    ns_to_ms(row.round_trip_ns),
                    ns_to_ms(row.forward_ns),
                    ns_to_ms(row.backward_ns),
                    ns_to_ms(row.reflector_delay_ns),
                    row.sender_ttl
                );
            }
            if !outcome.lost.is_empty() {
                let lost: Vec<String> = outcome.lost.iter().map(u32::to_string).collect();
                println!("Lost: {}", lost.join(", "));
            }
        }
    }

    fn print_json(&self) {
        match serde_json::to_string_pretty(self) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!("Cannot serialize report: {}", e),
        }
    }
}

fn ns_to_ms(ns: i64) -> f64 {
    ns as f64 / 1_000_000.0
}

/// Runs a complete measurement against the configured server.
///
/// Cancelling `cancel` interrupts the handshake or ends the test sessions
/// early; started sessions are still stopped on the server.
///
/// # Errors
/// Configuration problems, or the control session's terminal failure.
pub async fn run_client(
    conf: &Configuration,
    cancel: CancellationToken,
) -> Result<ClientReport, ClientError> {
    let control_options = conf.control_options()?;
    let test_options = conf.test_options()?;
    let deadline = control_options.control_deadline;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    let stream = connect(conf.local_addr, conf.remote(), deadline, &cancel).await?;
    let local_ip = stream.local_addr().map_err(TwampError::Io)?.ip();
    info!("Connected to TWAMP server {}", conf.remote());

    let start_time = clock.now().after(Duration::from_millis(conf.start_delay));
    let mut sockets = Vec::with_capacity(conf.sessions as usize);
    let mut requests = Vec::with_capacity(conf.sessions as usize);
    for _ in 0..conf.sessions {
        let socket = UdpSocket::bind(SocketAddr::new(conf.local_addr, 0))
            .await
            .map_err(TwampError::Io)?;
        if conf.dscp != 0 {
            if let Err(e) = socket.set_tos(u32::from(conf.dscp) << 2) {
                warn!("Cannot set DSCP {}: {}", conf.dscp, e);
            }
        }
        let port = socket.local_addr().map_err(TwampError::Io)?.port();
        requests.push(SessionRequest {
            sender: SocketAddr::new(local_ip, port),
            receiver: SocketAddr::new(conf.remote_addr, 0),
            packets: conf.packets,
            padding_length: None,
            start_time: Some(start_time),
            timeout: Duration::from_secs(conf.timeout),
            type_p: type_p_from_dscp(conf.dscp),
        });
        sockets.push(socket);
    }

    let mut control = ControlSession::new(stream, control_options, clock.clone(), cancel.clone());
    control.establish(&requests).await?;
    let sessions = control.enter_test_phase()?;
    let security = control
        .security()
        .ok_or_else(|| TwampError::ProtocolViolation("no security context".to_string()))?;

    let ready = connect_reflectors(&mut control, sessions, sockets).await?;

    let mut tasks = JoinSet::new();
    for (index, (params, socket)) in ready.into_iter().enumerate() {
        let cipher = security.test_cipher(&params.server_sid);
        let session = TestSession::new(params, test_options, socket, cipher, clock.clone());
        let token = cancel.child_token();
        tasks.spawn(async move { (index, session.run(token).await) });
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => warn!("Test session task failed: {}", e),
        }
    }
    outcomes.sort_by_key(|(index, _)| *index);

    control.stop_sessions().await?;
    info!("Control session closed");

    Ok(ClientReport {
        server: conf.remote(),
        mode: control.mode().unwrap_or(Mode::Unauthenticated),
        server_start_time: control.server_start_time(),
        sessions: outcomes.into_iter().map(|(_, o)| o).collect(),
    })
}

/// Points each test socket at its reflector.
///
/// The sessions are already running on the server, so a failure here stops
/// them before the error is returned.
async fn connect_reflectors<T: ControlTransport>(
    control: &mut ControlSession<T>,
    sessions: Vec<SessionParameters>,
    sockets: Vec<UdpSocket>,
) -> Result<Vec<(SessionParameters, UdpSocket)>, TwampError> {
    let mut ready = Vec::with_capacity(sessions.len());
    for (params, socket) in sessions.into_iter().zip(sockets) {
        if let Err(e) = socket.connect(params.receiver).await {
            warn!("Cannot reach reflector {}: {}", params.receiver, e);
            if let Err(stop) = control.stop_sessions().await {
                warn!("Stop-Sessions failed as well: {}", stop);
            }
            return Err(TwampError::Io(e));
        }
        ready.push((params, socket));
    }
    Ok(ready)
}

async fn connect(
    local: IpAddr,
    remote: SocketAddr,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<TcpStream, TwampError> {
    let socket = match remote {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if !local.is_unspecified() {
        socket.bind(SocketAddr::new(local, 0))?;
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TwampError::Cancelled),
        r = tokio::time::timeout(deadline, socket.connect(remote)) => match r {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(TwampError::Timeout("control connection")),
        },
    }
}
