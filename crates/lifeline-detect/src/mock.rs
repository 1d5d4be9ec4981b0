use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use lifeline_core::{ClassifierError, ContextJudge, JudgeVerdict, Message, RiskLevel};

/// Pre-programmed classifier replies for deterministic tests.
#[derive(Clone, Debug)]
pub enum MockVerdict {
    Ok(JudgeVerdict),
    Err(ClassifierError),
    /// Wait a duration, then resolve the inner reply.
    Delay(Duration, Box<MockVerdict>),
}

impl MockVerdict {
    pub fn ok(tier: RiskLevel, confidence: f64) -> Self {
        Self::Ok(JudgeVerdict { tier, confidence })
    }

    pub fn err(error: ClassifierError) -> Self {
        Self::Err(error)
    }

    pub fn delayed(delay: Duration, inner: MockVerdict) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Judge that replays its script in order. When `repeat_last` is set, the
/// final entry answers every call past the end of the script.
pub struct MockJudge {
    script: Vec<MockVerdict>,
    repeat_last: bool,
    call_count: AtomicUsize,
    seen: Mutex<Vec<(String, usize)>>,
}

impl MockJudge {
    pub fn new(script: Vec<MockVerdict>) -> Self {
        Self {
            script,
            repeat_last: false,
            call_count: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with the same reply.
    pub fn always(reply: MockVerdict) -> Self {
        Self {
            repeat_last: true,
            ..Self::new(vec![reply])
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Texts received so far, with the size of the context window sent along.
    pub fn seen(&self) -> Vec<(String, usize)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ContextJudge for MockJudge {
    async fn classify(&self, text: &str, context: &[Message]) -> Result<JudgeVerdict, ClassifierError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.seen.lock().push((text.to_string(), context.len()));

        let reply = match self.script.get(idx) {
            Some(r) => r.clone(),
            None if self.repeat_last && !self.script.is_empty() => self.script[self.script.len() - 1].clone(),
            None => {
                return Err(ClassifierError::Transport(format!(
                    "MockJudge: no reply configured for call {idx}"
                )))
            }
        };
        resolve(reply).await
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve(reply: MockVerdict) -> Result<JudgeVerdict, ClassifierError> {
    let mut current = reply;
    loop {
        match current {
            MockVerdict::Ok(v) => return Ok(v),
            MockVerdict::Err(e) => return Err(e),
            MockVerdict::Delay(d, inner) => {
                tokio::time::sleep(d).await;
                current = *inner;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_errors() {
        let judge = MockJudge::new(vec![
            MockVerdict::ok(RiskLevel::Low, 0.3),
            MockVerdict::err(ClassifierError::Malformed("?".into())),
        ]);
        assert_eq!(judge.classify("a", &[]).await.unwrap().tier, RiskLevel::Low);
        assert!(judge.classify("b", &[]).await.is_err());
        assert!(matches!(
            judge.classify("c", &[]).await,
            Err(ClassifierError::Transport(_))
        ));
        assert_eq!(judge.call_count(), 3);
        assert_eq!(judge.seen()[1].0, "b");
    }

    #[tokio::test]
    async fn always_repeats() {
        let judge = MockJudge::always(MockVerdict::ok(RiskLevel::High, 0.8));
        for _ in 0..5 {
            assert_eq!(judge.classify("x", &[]).await.unwrap().tier, RiskLevel::High);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn nested_delays_resolve() {
        let judge = MockJudge::new(vec![MockVerdict::delayed(
            Duration::from_millis(10),
            MockVerdict::delayed(Duration::from_millis(10), MockVerdict::ok(RiskLevel::None, 0.1)),
        )]);
        let start = tokio::time::Instant::now();
        let v = judge.classify("x", &[]).await.unwrap();
        assert_eq!(v.tier, RiskLevel::None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
