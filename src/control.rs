//! TWAMP-Control client session (RFC 4656 Section 3, RFC 5357 Section 3).
//!
//! The handshake is strictly sequential, so it is modelled as a state machine
//! with one method per transition:
//!
//! ```text
//! Init -> AwaitingGreeting -> GreetingValidated -> SetupSent -> AwaitingStart
//!      -> StartValidated -> RequestingSessions (repeatable) -> SessionsAccepted
//!      -> SessionsStarted -> TestPhase -> StoppingSessions -> Closed
//! ```
//!
//! Any error moves the session to `Failed`, after which every transition is
//! refused. Calling a transition from the wrong state is refused too, but does
//! not change the state.

use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{FailureKind, Result, TwampError},
    messages::{
        encode_address, validate_server_greeting, AcceptSession, ControlMessage,
        RequestSession, ServerGreeting, ServerStart, SessionId, StartAck, StartSessions,
        StopSessions, SERVER_GREETING_SIZE, SERVER_START_SIZE,
    },
    modes::{Mode, ModeSet},
    packets::padding_length,
    security::{ControlChains, Credentials, KeyMaterial, SecurityContext},
    test_session::SessionParameters,
    time::{Clock, Timestamp},
    transport::ControlTransport,
};

/// Well-known TWAMP-Control port.
pub const DEFAULT_CONTROL_PORT: u16 = 862;

/// Delay between requesting a session and its default start time.
pub const DEFAULT_START_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControlState {
    Init,
    AwaitingGreeting,
    GreetingValidated,
    SetupSent,
    AwaitingStart,
    StartValidated,
    RequestingSessions,
    SessionsAccepted,
    SessionsStarted,
    TestPhase,
    StoppingSessions,
    Closed,
    Failed(FailureKind),
}

impl ControlState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ControlState::Closed | ControlState::Failed(_))
    }
}

/// Client preferences for the control connection.
#[derive(Debug, Clone)]
pub struct ControlOptions {
    /// Modes the client is willing to use.
    pub modes: ModeSet,
    /// Needed for authenticated and encrypted modes.
    pub credentials: Option<Credentials>,
    /// Deadline for each control message read.
    pub control_deadline: Duration,
}

/// What the client asks for in one Request-TW-Session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Local UDP endpoint the probes are sent from.
    pub sender: SocketAddr,
    /// Reflector endpoint; port 0 lets the server pick.
    pub receiver: SocketAddr,
    pub packets: u32,
    /// Defaults to the padding that yields 128-byte packets in the negotiated mode.
    pub padding_length: Option<u32>,
    /// Defaults to now plus [`DEFAULT_START_DELAY`].
    pub start_time: Option<Timestamp>,
    pub timeout: Duration,
    pub type_p: u32,
}

pub struct ControlSession<T: ControlTransport> {
    transport: T,
    options: ControlOptions,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    state: ControlState,
    greeting: Option<ServerGreeting>,
    security: Option<Arc<SecurityContext>>,
    chains: ControlChains,
    server_start_time: Option<Timestamp>,
    used_sids: HashSet<SessionId>,
    sessions: Vec<SessionParameters>,
}

impl<T: ControlTransport> ControlSession<T> {
    /// Wraps an already connected control transport.
    pub fn new(
        transport: T,
        options: ControlOptions,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        ControlSession {
            transport,
            options,
            clock,
            cancel,
            state: ControlState::Init,
            greeting: None,
            security: None,
            chains: ControlChains::default(),
            server_start_time: None,
            used_sids: HashSet::new(),
            sessions: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ControlState {
        self.state
    }

    /// Negotiated mode, once the Set-Up-Response is sent.
    #[must_use]
    pub fn mode(&self) -> Option<Mode> {
        self.security.as_ref().map(|s| s.mode())
    }

    /// Shared, read-only security context for deriving test ciphers.
    #[must_use]
    pub fn security(&self) -> Option<Arc<SecurityContext>> {
        self.security.clone()
    }

    /// Start time announced in the Server-Start.
    #[must_use]
    pub fn server_start_time(&self) -> Option<Timestamp> {
        self.server_start_time
    }

    #[must_use]
    pub fn sessions(&self) -> &[SessionParameters] {
        &self.sessions
    }

    /// Gives the transport back, e.g. to shut it down.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Runs the handshake up to and including Start-Sessions.
    ///
    /// # Errors
    /// The first error of any step; the session is then `Failed`.
    pub async fn establish(&mut self, requests: &[SessionRequest]) -> Result<Vec<SessionParameters>> {
        self.receive_greeting().await?;
        self.send_setup_response().await?;
        self.receive_server_start().await?;
        for request in requests {
            self.request_session(request).await?;
        }
        self.start_sessions().await?;
        Ok(self.sessions.clone())
    }

    /// Reads and validates the Server Greeting; returns the advertised modes.
    ///
    /// # Errors
    /// `Timeout`, `Io`, or `ProtocolViolation` for an unusable greeting.
    pub async fn receive_greeting(&mut self) -> Result<ModeSet> {
        self.expect_state("receive_greeting", &[ControlState::Init])?;
        let result = self.receive_greeting_inner().await;
        self.settle(result)
    }

    async fn receive_greeting_inner(&mut self) -> Result<ModeSet> {
        self.transition(ControlState::AwaitingGreeting);
        let bytes = self.receive(SERVER_GREETING_SIZE, ServerGreeting::NAME).await?;
        let greeting = ServerGreeting::decode(&bytes)?;
        let modes = validate_server_greeting(&greeting)?;

        debug!(
            "Server-Greeting: modes {:#x}, count {}",
            greeting.modes, greeting.count
        );
        self.greeting = Some(greeting);
        self.transition(ControlState::GreetingValidated);
        Ok(modes)
    }

    /// Selects the mode, derives keys and sends the Set-Up-Response.
    ///
    /// # Errors
    /// `NoCommonMode`, `ProtocolViolation` for an unusable Count, `Io`.
    pub async fn send_setup_response(&mut self) -> Result<Mode> {
        self.expect_state("send_setup_response", &[ControlState::GreetingValidated])?;
        let result = self.send_setup_response_inner().await;
        self.settle(result)
    }

    async fn send_setup_response_inner(&mut self) -> Result<Mode> {
        let greeting = self
            .greeting
            .ok_or_else(|| TwampError::ProtocolViolation("no Server-Greeting".to_string()))?;
        let (context, response) = SecurityContext::negotiate(
            &greeting,
            self.options.modes,
            self.options.credentials.as_ref(),
            KeyMaterial::generate(),
        )?;
        let mode = context.mode();
        self.chains = context.control_chains();
        self.security = Some(Arc::new(context));

        self.send(&response.encode()).await?;
        info!("Negotiated TWAMP mode {:?}", mode);
        self.transition(ControlState::SetupSent);
        Ok(mode)
    }

    /// Reads the Server-Start and checks its Accept field.
    ///
    /// # Errors
    /// `ServerRejected(code)` for a non-zero Accept, plus read errors.
    pub async fn receive_server_start(&mut self) -> Result<Timestamp> {
        self.expect_state("receive_server_start", &[ControlState::SetupSent])?;
        let result = self.receive_server_start_inner().await;
        self.settle(result)
    }

    async fn receive_server_start_inner(&mut self) -> Result<Timestamp> {
        self.transition(ControlState::AwaitingStart);
        let bytes = self.receive(SERVER_START_SIZE, ServerStart::NAME).await?;
        let security = self.context()?;
        let start = security.open_server_start(&mut self.chains, &bytes)?;

        let code = start.accept_code();
        if !code.is_ok() {
            return Err(TwampError::ServerRejected(code));
        }

        debug!("Server-Start accepted, server start time {}", start.start_time);
        self.server_start_time = Some(start.start_time);
        self.transition(ControlState::StartValidated);
        Ok(start.start_time)
    }

    /// Requests one test session and records what the server accepted.
    ///
    /// # Errors
    /// `SessionRejected(code)` for a non-zero Accept, `AuthenticationFailed`
    /// for a bad HMAC, plus read errors.
    pub async fn request_session(&mut self, request: &SessionRequest) -> Result<SessionParameters> {
        self.expect_state(
            "request_session",
            &[ControlState::StartValidated, ControlState::RequestingSessions],
        )?;
        let result = self.request_session_inner(request).await;
        self.settle(result)
    }

    async fn request_session_inner(&mut self, request: &SessionRequest) -> Result<SessionParameters> {
        self.transition(ControlState::RequestingSessions);
        let security = self.context()?;

        let sid = self.fresh_sid();
        let padding = request
            .padding_length
            .unwrap_or_else(|| padding_length(security.mode()));
        let start_time = request
            .start_time
            .unwrap_or_else(|| self.clock.now().after(DEFAULT_START_DELAY));

        let (ipvn, sender_address) = encode_address(request.sender.ip());
        let (_, receiver_address) = encode_address(request.receiver.ip());
        let message = RequestSession {
            ipvn,
            packets: request.packets,
            sender_port: request.sender.port(),
            receiver_port: request.receiver.port(),
            sender_address,
            receiver_address,
            sid,
            padding_length: padding,
            start_time,
            timeout: Timestamp::from_duration(request.timeout),
            type_p: request.type_p,
            ..Default::default()
        };
        let wire = security.seal(&mut self.chains, &message.encode())?;
        self.send(&wire).await?;

        let accept: AcceptSession = self.receive_sealed().await?;
        let code = accept.accept_code();
        if !code.is_ok() {
            return Err(TwampError::SessionRejected(code));
        }
        if accept.port == 0 {
            return Err(TwampError::ProtocolViolation(
                "Accept-Session carries port 0".to_string(),
            ));
        }

        let params = SessionParameters {
            sender: request.sender,
            receiver: SocketAddr::new(request.receiver.ip(), accept.port),
            packets: request.packets,
            padding_length: padding,
            start_time,
            timeout: request.timeout,
            client_sid: sid,
            server_sid: accept.sid,
            reflector_port: accept.port,
            type_p: request.type_p,
        };
        info!(
            "Session {} accepted, reflector port {}",
            hex::encode(accept.sid),
            accept.port
        );
        self.sessions.push(params.clone());
        Ok(params)
    }

    /// Sends Start-Sessions and waits for the Start-Ack.
    ///
    /// # Errors
    /// `StartFailed(code)` for a non-zero Accept, plus read errors.
    pub async fn start_sessions(&mut self) -> Result<()> {
        self.expect_state("start_sessions", &[ControlState::RequestingSessions])?;
        let result = self.start_sessions_inner().await;
        self.settle(result)
    }

    async fn start_sessions_inner(&mut self) -> Result<()> {
        self.transition(ControlState::SessionsAccepted);
        self.send_sealed(&StartSessions::default()).await?;

        let ack: StartAck = self.receive_sealed().await?;
        let code = ack.accept_code();
        if !code.is_ok() {
            return Err(TwampError::StartFailed(code));
        }
        self.transition(ControlState::SessionsStarted);
        Ok(())
    }

    /// Hands out the accepted sessions; the control connection idles meanwhile.
    ///
    /// # Errors
    /// `InvalidState` unless the sessions were started.
    pub fn enter_test_phase(&mut self) -> Result<Vec<SessionParameters>> {
        self.expect_state("enter_test_phase", &[ControlState::SessionsStarted])?;
        self.transition(ControlState::TestPhase);
        Ok(self.sessions.clone())
    }

    /// Sends Stop-Sessions for every accepted session and closes.
    ///
    /// Not raced against cancellation, so a cancelled run still stops the
    /// server's sessions.
    ///
    /// # Errors
    /// `Io` if the message cannot be written.
    pub async fn stop_sessions(&mut self) -> Result<()> {
        self.expect_state(
            "stop_sessions",
            &[ControlState::SessionsStarted, ControlState::TestPhase],
        )?;
        let result = self.stop_sessions_inner().await;
        self.settle(result)
    }

    async fn stop_sessions_inner(&mut self) -> Result<()> {
        self.transition(ControlState::StoppingSessions);
        let stop = StopSessions::new(self.sessions.len() as u32);
        let security = self.context()?;
        let wire = security.seal(&mut self.chains, &stop.encode())?;
        self.transport.send(&wire).await?;
        self.transition(ControlState::Closed);
        Ok(())
    }

    fn expect_state(&self, operation: &'static str, allowed: &[ControlState]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(TwampError::InvalidState {
            operation,
            state: self.state,
        })
    }

    fn settle<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            warn!("Control session failed in {:?}: {}", self.state, e);
            self.state = ControlState::Failed(e.kind());
        }
        result
    }

    fn transition(&mut self, to: ControlState) {
        debug!("Control state {:?} -> {:?}", self.state, to);
        self.state = to;
    }

    fn context(&self) -> Result<Arc<SecurityContext>> {
        self.security.clone().ok_or_else(|| {
            TwampError::ProtocolViolation("security context not negotiated".to_string())
        })
    }

    fn fresh_sid(&mut self) -> SessionId {
        loop {
            let sid: SessionId = rand::random();
            if self.used_sids.insert(sid) {
                return sid;
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TwampError::Cancelled),
            r = self.transport.send(data) => r,
        }
    }

    async fn receive(&mut self, n: usize, what: &'static str) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.options.control_deadline;
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TwampError::Cancelled),
            r = self.transport.receive_exact(n, deadline) => r,
        };
        result.map_err(|e| match e {
            TwampError::Timeout(_) => TwampError::Timeout(what),
            other => other,
        })
    }

    async fn send_sealed<M: ControlMessage>(&mut self, message: &M) -> Result<()> {
        let security = self.context()?;
        let wire = security.seal(&mut self.chains, &message.encode())?;
        self.send(&wire).await
    }

    async fn receive_sealed<M: ControlMessage>(&mut self) -> Result<M> {
        let bytes = self.receive(M::SIZE, M::NAME).await?;
        let security = self.context()?;
        let plain = security.open(&mut self.chains, M::NAME, &bytes)?;
        Ok(M::decode(&plain)?)
    }
}
