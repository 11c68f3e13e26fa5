use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jobtrain::engine::{Confirmer, Decision};

/// Answers confirmations from a queue and records the questions asked.
/// Answers `Continue` once the queue is empty.
#[derive(Clone, Default)]
pub struct ScriptedConfirmer {
    answers: Arc<Mutex<VecDeque<Decision>>>,
    asked: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConfirmer {
    pub fn new<I: IntoIterator<Item = Decision>>(answers: I) -> Self {
        Self {
            answers: Arc::new(Mutex::new(answers.into_iter().collect())),
            asked: Arc::default(),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl Confirmer for ScriptedConfirmer {
    async fn confirm(&self, message: &str) -> Decision {
        self.asked.lock().unwrap().push(message.to_string());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Decision::Continue)
    }
}
