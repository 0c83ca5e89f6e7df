use std::fmt;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    connection::{Connection, Worker, WorkerEvent},
    decode::ensure_ok,
    format::format_queries,
    registry::SessionRegistry,
    split::split_queries,
    wire::{Command, QueryAck, WireResponse},
    ClientOptions, ConnectionState, DominoError, RelationSchema, Result, ResultId, Snapshot,
};

/// Handle to the client engine.
///
/// The engine is a single task that owns the connection state, the result
/// records and the schema listing. Commands are queued to it and return
/// immediately; outcomes, including errors, surface in the published
/// [`Snapshot`]. Handles are cheap to clone; the engine stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct DominoClient {
    commands: mpsc::UnboundedSender<EngineCommand>,
    state: watch::Receiver<Snapshot>,
    options: ClientOptions,
}

impl fmt::Debug for DominoClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DominoClient")
            .field("connection", &self.state.borrow().connection)
            .field("options", &self.options)
            .finish()
    }
}

impl DominoClient {
    /// Starts an engine with default options.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Self {
        Self::with_options(ClientOptions::default())
    }

    /// Starts an engine with the given batch size and timeouts.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn with_options(options: ClientOptions) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(Snapshot::default());
        let engine = Engine::new(options.clone(), state_tx);
        tokio::spawn(engine.run(command_rx));
        Self {
            commands,
            state,
            options,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Opens the connection and resolves once it is ready or has failed.
    ///
    /// An existing connection is torn down first, as by [`Self::disconnect`].
    /// A ready connection fetches the schema automatically.
    pub async fn connect(&self, host: impl Into<String>, port: u16) -> Result<ConnectionState> {
        let (reply, outcome) = oneshot::channel();
        self.send(EngineCommand::Connect {
            host: host.into(),
            port,
            reply,
        })?;
        outcome.await.map_err(|_| DominoError::EngineStopped)
    }

    /// Closes every open session, drops the connection and all results.
    pub fn disconnect(&self) -> Result<()> {
        self.send(EngineCommand::Disconnect)
    }

    /// Splits `text` into top-level expressions and submits them, replacing
    /// the current results.
    pub fn submit(&self, text: &str) -> Result<()> {
        self.submit_queries(split_queries(text))
    }

    /// Submits already-split queries, replacing the current results.
    pub fn submit_queries<I, S>(&self, queries: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queries = queries.into_iter().map(Into::into).collect();
        self.send(EngineCommand::Submit(queries))
    }

    /// Requests the next batch of rows for one result.
    ///
    /// Ignored while that result has no session or is already loading.
    pub fn load_more(&self, id: ResultId) -> Result<()> {
        self.send(EngineCommand::LoadMore(id))
    }

    /// Closes every open session and drops all results.
    pub fn clear(&self) -> Result<()> {
        self.send(EngineCommand::Clear)
    }

    /// Closes one result's session and drops the result.
    pub fn close(&self, id: ResultId) -> Result<()> {
        self.send(EngineCommand::Close(id))
    }

    /// Fetches the schema listing again.
    pub fn refresh_schema(&self) -> Result<()> {
        self.send(EngineCommand::RefreshSchema)
    }

    /// Formats every non-empty line of `text` into canonical spacing.
    pub fn format(text: &str) -> String {
        format_queries(text)
    }

    /// Latest published state.
    pub fn snapshot(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.clone()
    }

    /// Waits until the published state satisfies `predicate`.
    pub async fn wait_until(&self, predicate: impl FnMut(&Snapshot) -> bool) -> Result<Snapshot> {
        let mut state = self.state.clone();
        let snapshot = state
            .wait_for(predicate)
            .await
            .map_err(|_| DominoError::EngineStopped)?;
        Ok(snapshot.clone())
    }

    fn send(&self, command: EngineCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| DominoError::EngineStopped)
    }
}

impl Default for DominoClient {
    fn default() -> Self {
        Self::new()
    }
}

enum EngineCommand {
    Connect {
        host: String,
        port: u16,
        reply: oneshot::Sender<ConnectionState>,
    },
    Disconnect,
    Submit(Vec<String>),
    LoadMore(ResultId),
    Clear,
    Close(ResultId),
    RefreshSchema,
}

/// What a queued command's reply is for.
#[derive(Clone, Copy, Debug)]
enum Purpose {
    Schema,
    Query(ResultId),
    Next(ResultId),
}

struct ConnectOutcome {
    attempt: u64,
    result: std::result::Result<Connection, ConnectionState>,
}

enum Input {
    Command(EngineCommand),
    Connected(ConnectOutcome),
    Worker(Option<WorkerEvent<Purpose>>),
}

struct Engine {
    options: ClientOptions,
    connection: ConnectionState,
    error: Option<String>,
    schema: Vec<RelationSchema>,
    registry: SessionRegistry,
    // Bumped on every connect and teardown; stale connect outcomes are dropped.
    attempt: u64,
    pending_connect: Option<oneshot::Sender<ConnectionState>>,
    worker: Option<Worker<Purpose>>,
    worker_events: Option<mpsc::UnboundedReceiver<WorkerEvent<Purpose>>>,
    connect_tx: mpsc::UnboundedSender<ConnectOutcome>,
    connect_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
    published: watch::Sender<Snapshot>,
}

impl Engine {
    fn new(options: ClientOptions, published: watch::Sender<Snapshot>) -> Self {
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        Self {
            registry: SessionRegistry::new(options.batch_size),
            options,
            connection: ConnectionState::Idle,
            error: None,
            schema: Vec::new(),
            attempt: 0,
            pending_connect: None,
            worker: None,
            worker_events: None,
            connect_tx,
            connect_rx,
            published,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
        loop {
            let input = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Input::Command(command),
                    None => break,
                },
                Some(outcome) = self.connect_rx.recv() => Input::Connected(outcome),
                event = next_worker_event(&mut self.worker_events) => Input::Worker(event),
            };

            match input {
                Input::Command(command) => self.handle_command(command),
                Input::Connected(outcome) => self.handle_connected(outcome),
                Input::Worker(Some(event)) => self.handle_worker_event(event),
                Input::Worker(None) => self.worker_events = None,
            }
            self.publish();
        }

        self.teardown();
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Connect { host, port, reply } => self.connect(host, port, reply),
            EngineCommand::Disconnect => self.disconnect(),
            EngineCommand::Submit(queries) => self.submit(queries),
            EngineCommand::LoadMore(id) => self.load_more(id),
            EngineCommand::Clear => self.clear(),
            EngineCommand::Close(id) => {
                if let Some(session) = self.registry.remove(id) {
                    self.close_session(session);
                }
            }
            EngineCommand::RefreshSchema => self.fetch_schema(),
        }
    }

    fn connect(&mut self, host: String, port: u16, reply: oneshot::Sender<ConnectionState>) {
        if self.connection != ConnectionState::Idle {
            self.disconnect();
        }

        #[cfg(feature = "tracing")]
        tracing::info!(%host, port, "connecting");

        self.attempt += 1;
        self.connection = ConnectionState::Preparing;
        self.pending_connect = Some(reply);

        let attempt = self.attempt;
        let options = self.options.clone();
        let outcomes = self.connect_tx.clone();
        tokio::spawn(async move {
            let result = Connection::open(&host, port, &options).await;
            let _ = outcomes.send(ConnectOutcome { attempt, result });
        });
    }

    fn handle_connected(&mut self, outcome: ConnectOutcome) {
        if outcome.attempt != self.attempt {
            // Superseded by a disconnect or a newer connect; dropping the
            // connection closes it.
            return;
        }

        match outcome.result {
            Ok(connection) => {
                let (events_tx, events) = mpsc::unbounded_channel();
                self.worker = Some(Worker::spawn(connection, events_tx));
                self.worker_events = Some(events);
                self.set_connection(ConnectionState::Ready);
                self.fetch_schema();
            }
            Err(state) => self.set_connection(state),
        }

        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(self.connection.clone());
        }
    }

    fn set_connection(&mut self, state: ConnectionState) {
        #[cfg(feature = "tracing")]
        match &state {
            ConnectionState::Waiting(_) | ConnectionState::Failed(_) => {
                tracing::warn!(state = %state, "connection state changed")
            }
            _ => tracing::info!(state = %state, "connection state changed"),
        }

        self.error = state.error_message();
        self.connection = state;
    }

    fn disconnect(&mut self) {
        for session in self.registry.drain_sessions() {
            self.close_session(session);
        }
        // Dropping the worker discards its queued queries and fetches; only
        // the CLOSEs above still reach the server.
        self.worker = None;
        self.worker_events = None;
        self.attempt += 1;
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(ConnectionState::Cancelled);
        }
        self.set_connection(ConnectionState::Cancelled);
    }

    fn submit(&mut self, queries: Vec<String>) {
        if !self.connection.is_ready() {
            self.error = Some(DominoError::NotConnected.to_string());
            return;
        }
        if queries.is_empty() {
            self.error = Some(DominoError::EmptyInput.to_string());
            return;
        }

        for session in self.registry.drain_sessions() {
            self.close_session(session);
        }
        self.error = None;

        let submitted = self.registry.replace(queries, Instant::now());
        for (id, query) in submitted {
            self.dispatch(Command::Query(query), Purpose::Query(id));
        }
    }

    fn load_more(&mut self, id: ResultId) {
        let Some(session) = self.registry.begin_fetch(id) else {
            return;
        };
        let count = self.registry.batch_size();
        self.dispatch(Command::Next { session, count }, Purpose::Next(id));
    }

    fn clear(&mut self) {
        for session in self.registry.drain_sessions() {
            self.close_session(session);
        }
        self.error = None;
    }

    fn fetch_schema(&mut self) {
        if !self.connection.is_ready() {
            self.error = Some(DominoError::NotConnected.to_string());
            return;
        }
        self.dispatch(Command::Schema, Purpose::Schema);
    }

    fn close_session(&self, session: String) {
        if let Some(worker) = &self.worker {
            worker.send(Command::Close(session), None);
        }
    }

    /// Queues a command whose reply is routed back by `purpose`. A command
    /// that cannot be queued fails as `NotConnected`.
    fn dispatch(&mut self, command: Command, purpose: Purpose) {
        let queued = match &self.worker {
            Some(worker) => worker.send(command, Some(purpose)),
            None => false,
        };
        if !queued {
            self.handle_reply(purpose, Err(DominoError::NotConnected));
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent<Purpose>) {
        match event {
            WorkerEvent::Reply { ticket, outcome } => self.handle_reply(ticket, outcome),
            WorkerEvent::Lost { reason } => {
                self.worker = None;
                self.set_connection(ConnectionState::Failed(reason));
            }
        }
    }

    fn handle_reply(&mut self, purpose: Purpose, outcome: Result<WireResponse>) {
        if let Purpose::Query(id) | Purpose::Next(id) = purpose {
            if !self.registry.contains(id) {
                #[cfg(feature = "tracing")]
                tracing::trace!(result = %id, "dropping reply for removed result");

                // A late acknowledgement still opened a cursor on the server.
                if let Purpose::Query(_) = purpose {
                    if let Some(session) = outcome
                        .and_then(WireResponse::into_query_ack)
                        .ok()
                        .and_then(QueryAck::into_open_session)
                    {
                        self.close_session(session);
                    }
                }
                return;
            }
        }

        match purpose {
            Purpose::Schema => {
                let schema = outcome.and_then(WireResponse::into_schema).and_then(|schema| {
                    ensure_ok(&schema.status, schema.message.as_deref())?;
                    Ok(schema)
                });
                match schema {
                    Ok(schema) => self.schema = schema.relations,
                    Err(err) => self.error = Some(err.to_string()),
                }
            }
            Purpose::Query(id) => {
                let ack = outcome.and_then(WireResponse::into_query_ack);
                if self.registry.apply_ack(id, ack) {
                    self.load_more(id);
                }
            }
            Purpose::Next(id) => {
                let batch = outcome.and_then(WireResponse::into_tuple_batch);
                self.registry.apply_batch(id, batch, Instant::now());
            }
        }
    }

    fn publish(&self) {
        let next = Snapshot {
            connection: self.connection.clone(),
            is_connected: self.connection.is_ready(),
            is_loading: self.registry.is_loading(),
            error_message: self.error.clone(),
            results: self.registry.results(),
            schema: self.schema.clone(),
        };
        self.published.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn teardown(&mut self) {
        for session in self.registry.drain_sessions() {
            self.close_session(session);
        }
        self.worker = None;
        self.worker_events = None;
    }
}

async fn next_worker_event<T>(
    events: &mut Option<mpsc::UnboundedReceiver<WorkerEvent<T>>>,
) -> Option<WorkerEvent<T>> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
