//! Shared test support: a scripted transport.

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use stockroom::transfer::JobId;
use stockroom::{Outcome, TransferJob, TransferResult, Transport};

/// Each rule matches a url substring once, in order; unscripted urls fail
/// with a 404.
#[derive(Default)]
pub struct ScriptedTransport {
    rules: Mutex<Vec<(String, Outcome, Option<String>)>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn respond(&self, url_part: &str, outcome: Outcome) {
        self.respond_with_redirect(url_part, outcome, None);
    }

    pub fn respond_with_redirect(
        &self,
        url_part: &str,
        outcome: Outcome,
        redirect: Option<&str>,
    ) {
        self.rules
            .lock()
            .push((url_part.to_string(), outcome, redirect.map(str::to_string)));
    }

    pub fn requests(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

/// Keeps every job in flight until it is aborted; models a slow network.
#[derive(Default)]
pub struct HoldingTransport {
    held: Mutex<Vec<(JobId, Sender<TransferResult>)>>,
}

impl HoldingTransport {
    pub fn in_flight(&self) -> usize {
        self.held.lock().len()
    }
}

impl Transport for HoldingTransport {
    fn retrieve(&self, job: &TransferJob, results: &Sender<TransferResult>) {
        self.held.lock().push((job.id, results.clone()));
    }

    fn abort(&self, id: JobId, results: &Sender<TransferResult>) {
        self.held.lock().retain(|(held, _)| *held != id);
        let _ = results.send(TransferResult {
            id,
            outcome: Outcome::Aborted,
            redirect_url: None,
        });
    }

    fn abort_all(&self, _results: &Sender<TransferResult>) {
        for (id, tx) in self.held.lock().drain(..) {
            let _ = tx.send(TransferResult {
                id,
                outcome: Outcome::Aborted,
                redirect_url: None,
            });
        }
    }
}

impl Transport for ScriptedTransport {
    fn retrieve(&self, job: &TransferJob, results: &Sender<TransferResult>) {
        self.log.lock().push(job.url.clone());
        let mut rules = self.rules.lock();
        let pos = rules.iter().position(|(part, _, _)| job.url.contains(part));
        let (outcome, redirect_url) = match pos {
            Some(i) => {
                let (_, outcome, redirect) = rules.remove(i);
                (outcome, redirect)
            }
            None => (
                Outcome::Failed {
                    code: 404,
                    error: "unscripted".into(),
                },
                None,
            ),
        };
        let _ = results.send(TransferResult {
            id: job.id,
            outcome,
            redirect_url,
        });
    }

    fn abort(&self, id: JobId, results: &Sender<TransferResult>) {
        let _ = results.send(TransferResult {
            id,
            outcome: Outcome::Aborted,
            redirect_url: None,
        });
    }

    fn abort_all(&self, _results: &Sender<TransferResult>) {}
}
