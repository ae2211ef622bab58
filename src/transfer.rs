//! Transfer jobs and the coordinator
//!
//! The coordinator owns two logical channels over one [`Transport`]: an
//! anonymous channel for pictures and price guides, and an authenticated
//! channel guarded by a login session. The transport is an external
//! collaborator behind a trait; it delivers exactly one terminal
//! [`TransferResult`] per job on the coordinator's completion channel.
//!
//! Session rules: setting credentials invalidates the current session and
//! aborts in-flight authenticated jobs. The first authenticated job queued
//! while logged out triggers a single login handshake; jobs arriving while
//! the login is pending are buffered and replayed in arrival order once the
//! login resolves, on success and on failure alike (after a failed login
//! they fail individually). A redirect to the login page observed on any
//! authenticated job means the session expired out of band: the job is
//! re-queued transparently and the handshake re-runs, so its caller only
//! ever sees an eventual completion or failure.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type JobId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    /// form-encoded POST body
    Post(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: JobId,
    pub url: String,
    pub method: Method,
    /// stream the body to this file instead of buffering it
    pub destination: Option<PathBuf>,
    pub high_priority: bool,
    pub no_redirects: bool,
}

impl TransferJob {
    pub fn get(url: impl Into<String>) -> Self {
        TransferJob {
            id: 0,
            url: url.into(),
            method: Method::Get,
            destination: None,
            high_priority: false,
            no_redirects: false,
        }
    }

    pub fn post(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        TransferJob {
            id: 0,
            url: url.into(),
            method: Method::Post(form),
            destination: None,
            high_priority: false,
            no_redirects: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { code: u16, body: Vec<u8> },
    Failed { code: u16, error: String },
    Aborted,
}

#[derive(Debug, Clone)]
pub struct TransferResult {
    pub id: JobId,
    pub outcome: Outcome,
    pub redirect_url: Option<String>,
}

/// The network layer. Implementations deliver exactly one terminal result
/// per retrieved job on the supplied channel, from any thread.
pub trait Transport: Send + Sync {
    fn retrieve(&self, job: &TransferJob, results: &Sender<TransferResult>);
    fn abort(&self, id: JobId, results: &Sender<TransferResult>);
    fn abort_all(&self, results: &Sender<TransferResult>);
}

/// Session-related happenings surfaced to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    Changed(bool),
    Failed { user: String, error: String },
}

/// What the engine gets out of [`TransferCoordinator::poll`]
#[derive(Debug)]
pub enum CoordinatorEvent {
    Result(TransferResult),
    Auth(AuthEvent),
}

#[derive(Debug)]
enum Session {
    LoggedOut,
    LoggingIn { job_id: JobId, user: String },
    LoggedIn,
}

#[derive(Debug, Clone)]
struct Credentials {
    user: String,
    password: String,
}

/// Endpoints of the session sub-protocol
#[derive(Debug, Clone)]
pub struct SessionEndpoints {
    pub login_url: String,
    pub logout_url: String,
    /// substring of a redirect target that identifies the login page
    pub login_page_marker: String,
}

pub struct TransferCoordinator {
    transport: Arc<dyn Transport>,
    result_tx: Sender<TransferResult>,
    result_rx: Receiver<TransferResult>,
    next_id: JobId,
    session: Session,
    credentials: Option<Credentials>,
    endpoints: SessionEndpoints,
    /// authenticated jobs waiting for the login to resolve, in arrival order
    buffered: VecDeque<TransferJob>,
    /// in-flight authenticated jobs by id, kept for transparent re-queueing
    in_flight_auth: HashMap<JobId, TransferJob>,
    /// fire-and-forget jobs (logout) whose results are dropped
    ignored: HashSet<JobId>,
}

impl TransferCoordinator {
    pub fn new(transport: Arc<dyn Transport>, endpoints: SessionEndpoints) -> Self {
        let (result_tx, result_rx) = unbounded();
        TransferCoordinator {
            transport,
            result_tx,
            result_rx,
            next_id: 1,
            session: Session::LoggedOut,
            credentials: None,
            endpoints,
            buffered: VecDeque::new(),
            in_flight_auth: HashMap::new(),
            ignored: HashSet::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.session, Session::LoggedIn)
    }

    fn allocate(&mut self, mut job: TransferJob) -> TransferJob {
        job.id = self.next_id;
        self.next_id += 1;
        job
    }

    /// Anonymous channel: straight pass-through to the transport.
    pub fn retrieve(&mut self, job: TransferJob) -> JobId {
        let job = self.allocate(job);
        let id = job.id;
        self.transport.retrieve(&job, &self.result_tx);
        id
    }

    /// Authenticated channel: submits immediately when logged in, otherwise
    /// buffers the job and (if not already pending) starts the handshake.
    pub fn retrieve_authenticated(&mut self, job: TransferJob) -> JobId {
        let job = self.allocate(job);
        let id = job.id;
        match self.session {
            Session::LoggedIn => self.submit_authenticated(job),
            Session::LoggingIn { .. } => self.buffered.push_back(job),
            Session::LoggedOut => {
                if self.credentials.is_none() {
                    warn!(id, "authenticated retrieve without credentials");
                    let _ = self.result_tx.send(TransferResult {
                        id,
                        outcome: Outcome::Failed {
                            code: 0,
                            error: "no credentials set".into(),
                        },
                        redirect_url: None,
                    });
                    return id;
                }
                self.buffered.push_back(job);
                self.start_login();
            }
        }
        id
    }

    fn submit_authenticated(&mut self, job: TransferJob) {
        self.in_flight_auth.insert(job.id, job.clone());
        self.transport.retrieve(&job, &self.result_tx);
    }

    fn start_login(&mut self) {
        // one handshake at a time
        if matches!(self.session, Session::LoggingIn { .. }) {
            return;
        }
        let Some(credentials) = self.credentials.clone() else {
            return;
        };
        let mut job = TransferJob::post(
            self.endpoints.login_url.clone(),
            vec![
                ("userid".into(), credentials.user.clone()),
                ("password".into(), credentials.password),
            ],
        );
        job.high_priority = true;
        job.no_redirects = true;
        let job = self.allocate(job);
        debug!(user = %credentials.user, "starting login handshake");
        self.session = Session::LoggingIn {
            job_id: job.id,
            user: credentials.user,
        };
        self.transport.retrieve(&job, &self.result_tx);
    }

    /// Install new credentials. The current session is invalidated,
    /// in-flight authenticated jobs are aborted, and a logout request is
    /// fired if a session was actually open.
    pub fn set_credentials(&mut self, user: impl Into<String>, password: impl Into<String>) {
        let was_authenticated = self.is_authenticated();
        for id in self.in_flight_auth.keys().copied().collect::<Vec<_>>() {
            self.transport.abort(id, &self.result_tx);
        }
        if was_authenticated {
            let job = self.allocate(TransferJob::get(self.endpoints.logout_url.clone()));
            self.ignored.insert(job.id);
            self.transport.retrieve(&job, &self.result_tx);
        }
        self.session = Session::LoggedOut;
        self.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
    }

    /// Abort one in-flight job; the transport delivers its `Aborted` result.
    pub fn abort(&mut self, id: JobId) {
        self.transport.abort(id, &self.result_tx);
    }

    /// Abort everything in both channels. Buffered jobs get a synthesized
    /// `Aborted` result since the transport never saw them.
    pub fn abort_all(&mut self) {
        for job in self.buffered.drain(..) {
            let _ = self.result_tx.send(TransferResult {
                id: job.id,
                outcome: Outcome::Aborted,
                redirect_url: None,
            });
        }
        self.transport.abort_all(&self.result_tx);
    }

    /// Drain the completion channel, handling session traffic internally.
    /// Returns the next event the engine must act on, or `None` when the
    /// channel is empty.
    pub fn poll(&mut self) -> Option<CoordinatorEvent> {
        while let Ok(result) = self.result_rx.try_recv() {
            if let Some(event) = self.process(result) {
                return Some(event);
            }
        }
        None
    }

    fn process(&mut self, result: TransferResult) -> Option<CoordinatorEvent> {
        if self.ignored.remove(&result.id) {
            return None;
        }

        if let Session::LoggingIn { job_id, ref user } = self.session {
            if result.id == job_id {
                let user = user.clone();
                return self.finish_login(&user, result);
            }
        }

        if let Some(job) = self.in_flight_auth.remove(&result.id) {
            if self.is_login_redirect(&result) {
                // session expired out of band; the caller must not see this
                info!(id = result.id, "session expired, re-queueing job");
                self.session = Session::LoggedOut;
                self.buffered.push_back(job);
                self.start_login();
                return None;
            }
            return Some(CoordinatorEvent::Result(result));
        }

        Some(CoordinatorEvent::Result(result))
    }

    fn finish_login(&mut self, user: &str, result: TransferResult) -> Option<CoordinatorEvent> {
        let event = match result.outcome {
            Outcome::Completed { code: 200, ref body } => match login_return(body) {
                Ok(()) => {
                    info!(user, "login succeeded");
                    self.session = Session::LoggedIn;
                    Some(AuthEvent::Changed(true))
                }
                Err(message) => {
                    warn!(user, message, "login rejected");
                    self.session = Session::LoggedOut;
                    Some(AuthEvent::Failed {
                        user: user.into(),
                        error: message,
                    })
                }
            },
            Outcome::Completed { code, .. } => {
                warn!(user, code, "unexpected login response");
                self.session = Session::LoggedOut;
                Some(AuthEvent::Failed {
                    user: user.into(),
                    error: format!("unexpected response code {code}"),
                })
            }
            Outcome::Failed { code, ref error } => {
                warn!(user, code, error, "login transfer failed");
                self.session = Session::LoggedOut;
                Some(AuthEvent::Failed {
                    user: user.into(),
                    error: error.clone(),
                })
            }
            Outcome::Aborted => {
                self.session = Session::LoggedOut;
                None
            }
        };

        // the queue unblocks either way; after a failed login the replayed
        // jobs fail individually against the transport
        let replay: Vec<_> = self.buffered.drain(..).collect();
        for job in replay {
            self.submit_authenticated(job);
        }
        event.map(CoordinatorEvent::Auth)
    }

    fn is_login_redirect(&self, result: &TransferResult) -> bool {
        let redirected = matches!(
            result.outcome,
            Outcome::Completed { code: 301..=303, .. } | Outcome::Failed { code: 301..=303, .. }
        );
        redirected
            && result
                .redirect_url
                .as_deref()
                .is_some_and(|url| url.contains(&self.endpoints.login_page_marker))
    }
}

/// A login body is accepted iff it is JSON with `returnCode == 0`; the
/// `returnMessage` field is surfaced on rejection.
fn login_return(body: &[u8]) -> std::result::Result<(), String> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("undecodable login response: {e}"))?;
    match value.get("returnCode").and_then(|c| c.as_i64()) {
        Some(0) => Ok(()),
        _ => Err(value
            .get("returnMessage")
            .and_then(|m| m.as_str())
            .unwrap_or("login rejected")
            .to_string()),
    }
}
