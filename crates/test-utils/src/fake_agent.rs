use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use a2a_orchestrator::dag::patterns::template_key;
use a2a_orchestrator::engine::{AgentOutcome, EligibleTask, RuntimeEvent};
use a2a_orchestrator::errors::Result;
use a2a_orchestrator::exec::AgentBackend;
use tokio::sync::mpsc;

/// A fake agent backend that:
/// - records which task keys were dispatched, in order
/// - immediately reports an outcome for each of them (completed without a
///   result unless configured otherwise for the key or its loop template).
pub struct FakeAgent {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    executed: Arc<Mutex<Vec<String>>>,
    outcomes: HashMap<String, AgentOutcome>,
}

impl FakeAgent {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>, executed: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            runtime_tx,
            executed,
            outcomes: HashMap::new(),
        }
    }

    /// Report `outcome` for tasks with this key (exact key first, then loop
    /// template key).
    pub fn with_outcome(mut self, key: &str, outcome: AgentOutcome) -> Self {
        self.outcomes.insert(key.to_string(), outcome);
        self
    }

    fn outcome_for(&self, key: &str) -> AgentOutcome {
        self.outcomes
            .get(key)
            .or_else(|| self.outcomes.get(template_key(key)))
            .cloned()
            .unwrap_or(AgentOutcome::Completed(None))
    }
}

impl AgentBackend for FakeAgent {
    fn dispatch(
        &mut self,
        task: EligibleTask,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.runtime_tx.clone();
        let executed = Arc::clone(&self.executed);
        let outcome = self.outcome_for(&task.key);

        Box::pin(async move {
            {
                let mut guard = executed.lock().unwrap();
                guard.push(task.key.clone());
            }

            tx.send(RuntimeEvent::AgentReported {
                task: task.task_id,
                outcome,
            })
            .await
            .map_err(anyhow::Error::from)?;
            Ok(())
        })
    }
}
