//! In-memory doubles for the connection and factory seams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::Span;

use crate::conn::{Connection, ConnectionId, Deadline};
use crate::error::{ClientError, ClientResult};
use crate::factory::ConnectionFactory;

/// What the next `read_until` does.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(&'static str),
    /// Never answers; fails once the read deadline passes.
    Hang,
    Eof,
}

/// Observable side of a scripted connection, kept by the test.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
    pub closed: Arc<AtomicBool>,
    pub last_write_deadline: Arc<Mutex<Option<Duration>>>,
    pub last_read_deadline: Arc<Mutex<Option<Duration>>>,
}

impl Probe {
    pub fn written(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connection driven by a script instead of a socket.
pub struct ScriptedConnection {
    id: ConnectionId,
    addr: String,
    span: Span,
    steps: VecDeque<Step>,
    /// Replies with the last written bytes once the script runs dry.
    echo: bool,
    /// Maximum bytes accepted per write.
    accept_limit: Option<usize>,
    read_deadline: Option<Deadline>,
    probe: Probe,
}

impl ScriptedConnection {
    pub fn new(addr: &str) -> Self {
        ScriptedConnection {
            id: ConnectionId::next(),
            addr: addr.to_string(),
            span: Span::none(),
            steps: VecDeque::new(),
            echo: false,
            accept_limit: None,
            read_deadline: None,
            probe: Probe::default(),
        }
    }

    pub fn with_steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn echoing(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn accepting_at_most(mut self, limit: usize) -> Self {
        self.accept_limit = Some(limit);
        self
    }

    pub fn probe(&self) -> Probe {
        self.probe.clone()
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    fn span(&self) -> &Span {
        &self.span
    }

    fn set_write_deadline(&mut self, deadline: Option<Deadline>) {
        *self.probe.last_write_deadline.lock().unwrap() = deadline.map(|d| d.budget());
    }

    fn set_read_deadline(&mut self, deadline: Option<Deadline>) {
        *self.probe.last_read_deadline.lock().unwrap() = deadline.map(|d| d.budget());
        self.read_deadline = deadline;
    }

    async fn write(&mut self, buf: &[u8]) -> ClientResult<usize> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let accepted = self.accept_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        self.probe.writes.lock().unwrap().push(buf[..accepted].to_vec());
        Ok(accepted)
    }

    async fn read_until(&mut self, _delim: u8) -> ClientResult<Vec<u8>> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        match self.steps.pop_front() {
            Some(Step::Reply(text)) => Ok(text.as_bytes().to_vec()),
            Some(Step::Hang) => {
                let deadline = self.read_deadline.ok_or(ClientError::Closed)?;
                tokio::time::sleep_until(deadline.instant()).await;
                Err(ClientError::Timeout(deadline.budget()))
            }
            Some(Step::Eof) => Err(ClientError::Eof { buffered: 0 }),
            None if self.echo => {
                let last = self.probe.writes.lock().unwrap().last().cloned();
                last.ok_or(ClientError::Eof { buffered: 0 })
            }
            None => Err(ClientError::Eof { buffered: 0 }),
        }
    }

    async fn close(&mut self) -> ClientResult<()> {
        self.probe.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.probe.is_closed()
    }
}

type Template = Box<dyn Fn(&str) -> ScriptedConnection + Send + Sync>;

/// Factory producing scripted connections and counting every attempt.
pub struct ScriptedFactory {
    template: Template,
    attempts: AtomicUsize,
    fail_next: AtomicBool,
    created: Mutex<Vec<(ConnectionId, Probe)>>,
}

impl ScriptedFactory {
    pub fn new(template: impl Fn(&str) -> ScriptedConnection + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(ScriptedFactory {
            template: Box::new(template),
            attempts: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn echo() -> Arc<Self> {
        Self::new(|key| ScriptedConnection::new(key).echoing())
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<(ConnectionId, Probe)> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    async fn create(&self, key: &str) -> ClientResult<Box<dyn Connection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ClientError::Handshake {
                addr: key.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        let conn = (self.template)(key);
        self.created.lock().unwrap().push((conn.id(), conn.probe()));
        Ok(Box::new(conn))
    }
}
