use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::buffer::{Admission, CandidateBuffer};
use super::channel::{
    CandidateSubscription, DescriptionSnapshot, DescriptionSubscription, SignalingChannel,
};
use super::state::NegotiationState;
use crate::engine::{
    EngineEvent, EngineFactory, MediaSource, MediaTrack, RemoteTrack, TransportEngine,
};
use crate::error::NegotiationError;
use crate::model::{
    IceCandidate, PublishedCandidate, Role, SessionDescription, SessionId, Side,
};

const EVENT_CAPACITY: usize = 64;

/// Collaborators shared by every negotiator of a process.
#[derive(Clone)]
pub struct NegotiatorDeps {
    pub channel: SignalingChannel,
    pub engines: Arc<dyn EngineFactory>,
    pub media: Arc<dyn MediaSource>,
}

/// Notifications for whoever owns the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(NegotiationState),
    RemoteTrack(RemoteTrack),
    Failed { reason: String },
}

type Reply<T> = oneshot::Sender<Result<T, NegotiationError>>;

enum Command {
    Initiate {
        tracks: Vec<MediaTrack>,
        reply: Reply<SessionId>,
    },
    Respond {
        session: SessionId,
        reply: Reply<()>,
    },
    RemoteDescription {
        description: SessionDescription,
        reply: Reply<()>,
    },
    RemoteCandidate {
        candidate: IceCandidate,
        reply: Reply<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one side of a negotiated session.
///
/// All work happens on a dedicated task that consumes commands, engine events and
/// store deliveries one at a time. Dropping every clone of the handle closes the
/// session.
#[derive(Clone)]
pub struct SessionNegotiator {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<NegotiationState>,
    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for SessionNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionNegotiator")
            .field("state", &*self.state.borrow())
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

impl SessionNegotiator {
    pub fn spawn(deps: NegotiatorDeps) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(NegotiationState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let negotiator = Negotiator {
            deps,
            commands: command_rx,
            state: state_tx,
            events: events.clone(),
            session: None,
            engine: None,
            engine_events: None,
            descriptions: None,
            candidates: None,
        };
        tokio::spawn(negotiator.run());

        Self {
            commands,
            state,
            events,
        }
    }

    /// Starts a session as the caller and returns its id once the offer is published.
    pub async fn initiate_session(&self, tracks: Vec<MediaTrack>) -> Result<SessionId, NegotiationError> {
        self.request(|reply| Command::Initiate { tracks, reply }).await
    }

    /// Joins `session` as the answerer and publishes the answer.
    pub async fn respond_to_session(&self, session: SessionId) -> Result<(), NegotiationError> {
        self.request(|reply| Command::Respond { session, reply }).await
    }

    pub async fn on_remote_description_available(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.request(|reply| Command::RemoteDescription { description, reply })
            .await
    }

    pub async fn on_remote_candidate_available(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        self.request(|reply| Command::RemoteCandidate { candidate, reply })
            .await
    }

    /// Unsubscribes, releases the engine and marks the session closed.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).is_ok() {
            let _ = done.await;
        }
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Waits until the state satisfies `predicate` and returns it.
    ///
    /// Returns the last known state if the negotiator task has exited first.
    pub async fn wait_for_state(
        &self,
        predicate: impl Fn(NegotiationState) -> bool,
    ) -> NegotiationState {
        let mut state = self.state.clone();
        let reached = state.wait_for(|current| predicate(*current)).await.map(|s| *s);
        reached.unwrap_or_else(|_| *state.borrow())
    }

    /// Whether both handles drive the same negotiator task.
    pub fn same_session(&self, other: &SessionNegotiator) -> bool {
        self.state.same_channel(&other.state)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, NegotiationError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| NegotiationError::Closed)?;
        response.await.map_err(|_| NegotiationError::Closed)?
    }
}

struct ActiveSession {
    id: SessionId,
    role: Role,
    buffer: CandidateBuffer<IceCandidate>,
    remote: Option<SessionDescription>,
}

impl ActiveSession {
    fn new(id: SessionId, role: Role) -> Self {
        Self {
            id,
            role,
            buffer: CandidateBuffer::new(),
            remote: None,
        }
    }
}

struct Negotiator {
    deps: NegotiatorDeps,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<NegotiationState>,
    events: broadcast::Sender<SessionEvent>,
    session: Option<ActiveSession>,
    engine: Option<Arc<dyn TransportEngine>>,
    engine_events: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    descriptions: Option<DescriptionSubscription>,
    candidates: Option<CandidateSubscription>,
}

impl Negotiator {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_engine_event(&mut self.engine_events) => match event {
                    Some(event) => self.handle_engine_event(event).await,
                    None => self.engine_events = None,
                },
                snapshot = next_description(&mut self.descriptions) => match snapshot {
                    Some(snapshot) => self.handle_description_snapshot(snapshot).await,
                    None => self.descriptions = None,
                },
                candidate = next_candidate(&mut self.candidates) => match candidate {
                    Some(candidate) => self.handle_store_candidate(candidate).await,
                    None => self.candidates = None,
                },
            }
        }

        debug!(target = "pier", session = %self.session_label(), "all handles dropped");
        self.close().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initiate { tracks, reply } => {
                let _ = reply.send(self.initiate(tracks).await);
            }
            Command::Respond { session, reply } => {
                let _ = reply.send(self.respond(session).await);
            }
            Command::RemoteDescription { description, reply } => {
                let result = self.apply_remote_description(description).await.map(|_| ());
                let _ = reply.send(result);
            }
            Command::RemoteCandidate { candidate, reply } => {
                let result = self.accept_remote_candidate(candidate).await;
                if let Err(err) = &result {
                    warn!(target = "pier", session = %self.session_label(), error = %err, "remote candidate not applied");
                }
                let _ = reply.send(result);
            }
            Command::Close { reply } => {
                self.close().await;
                let _ = reply.send(());
            }
        }
    }

    fn ensure_fresh(&self) -> Result<(), NegotiationError> {
        if self.session.is_some() {
            return Err(NegotiationError::AlreadyInitiated);
        }
        if self.current().is_terminal() {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    async fn initiate(&mut self, tracks: Vec<MediaTrack>) -> Result<SessionId, NegotiationError> {
        self.ensure_fresh()?;
        let id = SessionId::generate();
        self.session = Some(ActiveSession::new(id.clone(), Role::Caller));

        match self.start_caller(&id, &tracks).await {
            Ok(()) => Ok(id),
            Err(err) => {
                self.abort(&err).await;
                Err(err)
            }
        }
    }

    async fn start_caller(&mut self, id: &SessionId, tracks: &[MediaTrack]) -> Result<(), NegotiationError> {
        let engine = self.create_engine().await?;
        for track in tracks {
            engine.add_track(track).await?;
        }
        let offer = engine.create_offer().await?;
        engine.set_local_description(&offer).await?;

        let channel = self.deps.channel.clone();
        channel.publish_description(id, &offer).await?;
        self.descriptions = Some(channel.subscribe_description(id).await?);
        self.candidates = Some(channel.subscribe_candidates(id, Side::Answer).await?);
        self.transition(NegotiationState::OfferSent);
        Ok(())
    }

    async fn respond(&mut self, id: SessionId) -> Result<(), NegotiationError> {
        self.ensure_fresh()?;
        let offer = self
            .deps
            .channel
            .fetch_session(&id)
            .await?
            .and_then(|session| session.offer)
            .ok_or_else(|| NegotiationError::SessionNotFound(id.clone()))?;
        self.session = Some(ActiveSession::new(id.clone(), Role::Answerer));

        match self.start_answerer(&id, offer).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.abort(&err).await;
                Err(err)
            }
        }
    }

    async fn start_answerer(&mut self, id: &SessionId, offer: SessionDescription) -> Result<(), NegotiationError> {
        let tracks = self.deps.media.acquire().await?;
        let engine = self.create_engine().await?;
        for track in &tracks {
            engine.add_track(track).await?;
        }
        self.apply_remote_description(offer).await?;

        let answer = engine.create_answer().await?;
        engine.set_local_description(&answer).await?;
        let channel = self.deps.channel.clone();
        channel.publish_description(id, &answer).await?;
        self.transition(NegotiationState::AnswerSent);

        self.candidates = Some(channel.subscribe_candidates(id, Side::Offer).await?);
        Ok(())
    }

    async fn create_engine(&mut self) -> Result<Arc<dyn TransportEngine>, NegotiationError> {
        let (events, engine_events) = mpsc::unbounded_channel();
        let engine = self.deps.engines.create(events).await?;
        self.engine = Some(Arc::clone(&engine));
        self.engine_events = Some(engine_events);
        Ok(engine)
    }

    /// Unwinds a failed initiate or respond.
    ///
    /// Without an engine nothing was acquired and the negotiator stays usable.
    async fn abort(&mut self, err: &NegotiationError) {
        warn!(target = "pier", session = %self.session_label(), error = %err, "session setup failed");
        if self.engine.is_none() {
            self.session = None;
            return;
        }
        self.teardown().await;
        self.fail(err.to_string());
    }

    /// Applies the remote description once; later deliveries are ignored.
    ///
    /// Returns whether this call applied it.
    async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<bool, NegotiationError> {
        if self.current().is_terminal() {
            return Err(NegotiationError::Closed);
        }
        let engine = self.engine.clone().ok_or(NegotiationError::NotStarted)?;
        let session = self.session.as_ref().ok_or(NegotiationError::NotStarted)?;
        description
            .validate(session.role.remote_kind())
            .map_err(NegotiationError::InvalidRemoteDescription)?;

        if let Some(applied) = &session.remote {
            if applied == &description {
                debug!(target = "pier", session = %session.id, role = ?session.role, "remote description already applied");
            } else {
                warn!(target = "pier", session = %session.id, role = ?session.role, "ignoring a different remote description");
            }
            return Ok(false);
        }

        engine.set_remote_description(&description).await?;

        let Some(session) = self.session.as_mut() else {
            return Err(NegotiationError::NotStarted);
        };
        session.remote = Some(description);
        let pending = session.buffer.flush();
        let next = match session.role {
            Role::Caller => NegotiationState::AnswerApplied,
            Role::Answerer => NegotiationState::OfferApplied,
        };
        debug!(target = "pier", session = %session.id, buffered = pending.len(), "remote description applied");
        self.transition(next);

        for candidate in pending {
            if let Err(err) = engine.add_ice_candidate(&candidate).await {
                warn!(target = "pier", session = %self.session_label(), error = %err, "buffered candidate rejected");
            }
        }
        Ok(true)
    }

    async fn accept_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if self.current().is_terminal() {
            return Err(NegotiationError::Closed);
        }
        candidate
            .validate()
            .map_err(NegotiationError::InvalidCandidate)?;
        let engine = self.engine.clone().ok_or(NegotiationError::NotStarted)?;
        let session = self.session.as_mut().ok_or(NegotiationError::NotStarted)?;

        match session.buffer.push(candidate) {
            Admission::Buffered => {
                debug!(target = "pier", session = %session.id, buffered = session.buffer.len(), "candidate buffered");
                Ok(())
            }
            Admission::Ready(candidate) => {
                engine.add_ice_candidate(&candidate).await?;
                Ok(())
            }
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => self.publish_local_candidate(candidate).await,
            EngineEvent::RemoteTrack(track) => {
                debug!(target = "pier", session = %self.session_label(), track = %track.id, kind = ?track.kind, "remote track");
                let _ = self.events.send(SessionEvent::RemoteTrack(track));
            }
            EngineEvent::ConnectionState(connection) => {
                debug!(target = "pier", session = %self.session_label(), ?connection, state = ?self.current(), "engine connectivity");
                match self.current().on_connection(connection) {
                    Some(NegotiationState::Failed) => {
                        self.fail("transport engine reported a connectivity failure".into())
                    }
                    Some(NegotiationState::Closed) => {
                        self.teardown().await;
                        self.transition(NegotiationState::Closed);
                    }
                    Some(next) => self.transition(next),
                    None => {}
                }
            }
        }
    }

    async fn publish_local_candidate(&mut self, candidate: IceCandidate) {
        if self.current().is_terminal() {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if let Err(err) = self
            .deps
            .channel
            .publish_candidate(&session.id, session.role.local_side(), &candidate)
            .await
        {
            warn!(target = "pier", session = %session.id, role = ?session.role, error = %err, "local candidate not published");
        }
    }

    async fn handle_description_snapshot(&mut self, snapshot: DescriptionSnapshot) {
        let Some(kind) = self.session.as_ref().map(|s| s.role.remote_kind()) else {
            return;
        };
        let Some(description) = snapshot.get(kind).cloned() else {
            return;
        };
        if let Err(err) = self.apply_remote_description(description).await {
            warn!(target = "pier", session = %self.session_label(), error = %err, "remote description not applied");
        }
    }

    async fn handle_store_candidate(&mut self, published: PublishedCandidate) {
        let sequence = published.sequence;
        if let Err(err) = self.accept_remote_candidate(published.candidate).await {
            warn!(target = "pier", session = %self.session_label(), sequence, error = %err, "remote candidate not applied");
        }
    }

    /// Releases resources in reverse acquisition order.
    async fn teardown(&mut self) {
        self.candidates = None;
        self.descriptions = None;
        self.engine_events = None;
        if let Some(engine) = self.engine.take() {
            if let Err(err) = engine.close().await {
                warn!(target = "pier", session = %self.session_label(), error = %err, "engine close failed");
            }
        }
    }

    async fn close(&mut self) {
        self.teardown().await;
        if !self.current().is_terminal() {
            self.transition(NegotiationState::Closed);
        }
    }

    fn fail(&mut self, reason: String) {
        if self.current().is_terminal() {
            return;
        }
        self.transition(NegotiationState::Failed);
        let _ = self.events.send(SessionEvent::Failed { reason });
    }

    fn current(&self) -> NegotiationState {
        *self.state.borrow()
    }

    fn transition(&self, next: NegotiationState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        debug!(
            target = "pier",
            session = %self.session_label(),
            role = ?self.session.as_ref().map(|s| s.role),
            from = ?previous,
            to = ?next,
            "negotiation state changed"
        );
        let _ = self.events.send(SessionEvent::StateChanged(next));
    }

    fn session_label(&self) -> &str {
        self.session.as_ref().map_or("-", |session| session.id.as_str())
    }
}

async fn next_engine_event(events: &mut Option<mpsc::UnboundedReceiver<EngineEvent>>) -> Option<EngineEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_description(
    descriptions: &mut Option<DescriptionSubscription>,
) -> Option<DescriptionSnapshot> {
    match descriptions {
        Some(descriptions) => descriptions.next().await,
        None => std::future::pending().await,
    }
}

async fn next_candidate(candidates: &mut Option<CandidateSubscription>) -> Option<PublishedCandidate> {
    match candidates {
        Some(candidates) => candidates.next().await,
        None => std::future::pending().await,
    }
}

