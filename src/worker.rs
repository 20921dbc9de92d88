//! Inference worker.
//!
//! The worker claims one job at a time from the front end, retrieves
//! context, asks the language model, and reports the result back:
//!
//! ```text
//! claim ──▶ validate ──▶ retrieve ──▶ assemble ──▶ complete ──▶ finish
//!   ▲  (empty: sleep poll_interval)                                 │
//!   └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transport failures back off exponentially (2 s doubling to 32 s by
//! default) and reset after any successful response. A 403 from the front
//! end means the shared secret is wrong and stops the worker.
//!
//! Two [`QueueClient`]s exist: [`HttpQueueClient`] talks to the front end
//! over HTTP; [`DirectQueueClient`] drives a [`JobQueue`] in-process for
//! single-host deployments.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::{Config, WorkerConfig};
use crate::context;
use crate::db;
use crate::embedding;
use crate::liveness;
use crate::llm::{self, ChatModel};
use crate::models::{ChatMessage, Job};
use crate::queue::JobQueue;
use crate::search::{retrieval_query, Retriever};
use crate::store::SqliteStore;
use crate::wire::{ClaimPayload, FinishForm};

/// Answer stored when the model call fails.
pub const LLM_FAILURE_ANSWER: &str =
    "[LLM exception, context length might be exceeded, please start a new session]";

// ============ Backoff ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub multiplier: u32,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            initial: Duration::from_secs(config.backoff_initial_secs),
            multiplier: 2,
            cap: Duration::from_secs(config.backoff_max_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            multiplier: 2,
            cap: Duration::from_secs(32),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            current: policy.initial,
        }
    }

    /// Delay to wait now; grows the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        if self.current < self.policy.cap {
            self.current = (self.current * self.policy.multiplier).min(self.policy.cap);
        }
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial;
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// ============ Queue clients ============

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("shared secret rejected by {0}")]
    Rejected(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn claim(&self) -> Result<Option<Job>, ClientError>;

    async fn finish(
        &self,
        id: &str,
        conversation_llm: &[ChatMessage],
        conversation: &[String],
        source: &[String],
    ) -> Result<(), ClientError>;

    async fn heartbeat(&self) -> Result<(), ClientError>;
}

pub struct HttpQueueClient {
    client: reqwest::Client,
    endpoint: String,
    secret: String,
}

impl HttpQueueClient {
    pub fn new(endpoint: &str, secret: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let Some(secret) = config.worker_secret() else {
            bail!(
                "worker.preshared_secret is not set (or set {})",
                crate::config::SECRET_ENV
            );
        };
        Self::new(&config.worker.endpoint, secret)
    }

    async fn check(&self, response: reqwest::Response) -> Result<String, ClientError> {
        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(ClientError::Rejected(self.endpoint.clone()));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

/// Decode a `/claim_job` body: `{}` means no work.
pub fn parse_claim(body: &str) -> Result<Option<Job>, ClientError> {
    if body.trim() == "{}" {
        return Ok(None);
    }
    let payload: ClaimPayload =
        serde_json::from_str(body).map_err(|e| ClientError::Malformed(e.to_string()))?;
    payload
        .into_job()
        .map(Some)
        .map_err(|e| ClientError::Malformed(e.to_string()))
}

#[async_trait]
impl QueueClient for HttpQueueClient {
    async fn claim(&self) -> Result<Option<Job>, ClientError> {
        let response = self
            .client
            .get(format!("{}/claim_job", self.endpoint))
            .query(&[("secret", &self.secret)])
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let body = self.check(response).await?;
        parse_claim(&body)
    }

    async fn finish(
        &self,
        id: &str,
        conversation_llm: &[ChatMessage],
        conversation: &[String],
        source: &[String],
    ) -> Result<(), ClientError> {
        let form = FinishForm::new(&self.secret, id, conversation_llm, conversation, source)
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        let response = self
            .client
            .post(format!("{}/finish_job", self.endpoint))
            .form(&form)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        self.check(response).await.map(|_| ())
    }

    async fn heartbeat(&self) -> Result<(), ClientError> {
        let response = self
            .client
            .get(format!("{}/heartbeat", self.endpoint))
            .query(&[("secret", &self.secret)])
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        self.check(response).await.map(|_| ())
    }
}

/// Queue client that talks to the database directly instead of the front
/// end.
pub struct DirectQueueClient {
    queue: JobQueue,
}

impl DirectQueueClient {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }
}

fn store_error(e: anyhow::Error) -> ClientError {
    ClientError::Transport(format!("{:#}", e))
}

#[async_trait]
impl QueueClient for DirectQueueClient {
    async fn claim(&self) -> Result<Option<Job>, ClientError> {
        self.queue.claim().await.map_err(store_error)
    }

    async fn finish(
        &self,
        id: &str,
        conversation_llm: &[ChatMessage],
        conversation: &[String],
        source: &[String],
    ) -> Result<(), ClientError> {
        self.queue
            .finish(id, conversation_llm, conversation, source)
            .await
            .map(|_| ())
            .map_err(store_error)
    }

    async fn heartbeat(&self) -> Result<(), ClientError> {
        liveness::heartbeat(self.queue.store().as_ref())
            .await
            .map_err(store_error)
    }
}

// ============ Worker ============

/// What one iteration of the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The job was answered and reported back.
    Finished(String),
    /// The job failed validation and was left unfinished.
    Dropped(String),
    /// The result could not be delivered; the job stays in processing.
    Undelivered(String),
}

/// The lists a finished job is reported with.
#[derive(Debug, Clone, PartialEq)]
pub struct Answered {
    pub conversation_llm: Vec<ChatMessage>,
    pub conversation: Vec<String>,
    pub source: Vec<String>,
}

pub struct Worker {
    client: Arc<dyn QueueClient>,
    sleeper: Arc<dyn Sleeper>,
    retriever: Retriever,
    model: Arc<dyn ChatModel>,
    top_k: usize,
    top_n: usize,
    policy: RetryPolicy,
    poll_interval: Duration,
    malformed_delay: Duration,
}

impl Worker {
    pub fn new(
        config: &Config,
        client: Arc<dyn QueueClient>,
        sleeper: Arc<dyn Sleeper>,
        retriever: Retriever,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            client,
            sleeper,
            retriever,
            model,
            top_k: config.retrieval.top_k,
            top_n: config.retrieval.top_n,
            policy: RetryPolicy::from_config(&config.worker),
            poll_interval: config.worker.poll_interval(),
            malformed_delay: config.worker.malformed_delay(),
        }
    }

    /// Poll until a job is available or `shutdown` flips to `true`. Only a
    /// rejected secret is an error.
    ///
    /// Shutdown is observed between claims and during the sleeps, never
    /// while a claim is in flight: the front end commits the claim before
    /// it answers, so a job it hands out must be handled.
    pub async fn next_job(
        &self,
        backoff: &mut Backoff,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Job>> {
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }
            let delay = match self.client.claim().await {
                Ok(Some(job)) => {
                    backoff.reset();
                    return Ok(Some(job));
                }
                Ok(None) => {
                    backoff.reset();
                    self.poll_interval
                }
                Err(ClientError::Malformed(msg)) => {
                    backoff.reset();
                    tracing::warn!(error = %msg, "cannot parse claim response");
                    self.malformed_delay
                }
                Err(e @ ClientError::Rejected(_)) => return Err(e.into()),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, delay_secs = delay.as_secs_f64(), "claim failed, backing off");
                    delay
                }
            };
            tokio::select! {
                _ = self.sleeper.sleep(delay) => {}
                _ = shutdown.changed() => return Ok(None),
            }
        }
    }

    /// Retrieve, assemble and complete one validated job.
    pub async fn answer(&self, job: &Job) -> Answered {
        let question = job.question().unwrap_or_default();
        let first_turn = job.conversation_llm.is_empty();
        let query = retrieval_query(
            if first_turn { None } else { job.previous_turn() },
            question,
        );

        let results = match self.retriever.search(&query, self.top_k).await {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(session = %job.id, error = %format!("{:#}", e), "retrieval failed, using empty context");
                Vec::new()
            }
        };
        for r in &results {
            tracing::debug!(
                rank = r.rank,
                distance = r.distance,
                tag = %r.chunk.tag,
                offset = r.chunk.start_pos,
                file = %r.chunk.file_name,
                context = r.rank < self.top_n,
                "retrieved"
            );
        }

        let turn = context::assemble(&job.conversation_llm, question, &results, self.top_n);

        let started = std::time::Instant::now();
        let answer = match self.model.complete(&turn.messages).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!(session = %job.id, error = %format!("{:#}", e), "inference failed");
                LLM_FAILURE_ANSWER.to_string()
            }
        };
        tracing::info!(
            session = %job.id,
            first_turn,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "inference done"
        );

        let mut conversation_llm = turn.messages;
        conversation_llm.push(ChatMessage::assistant(answer.clone()));
        let mut conversation = job.conversation.clone();
        conversation.push(answer);
        let mut source = job.source.clone();
        source.extend(turn.citations);

        Answered {
            conversation_llm,
            conversation,
            source,
        }
    }

    /// Validate, answer and report one claimed job.
    pub async fn handle(&self, job: Job, backoff: &mut Backoff) -> Result<Outcome> {
        if let Err(violation) = job.validate() {
            tracing::error!(session = %job.id, %violation, "dropping job");
            return Ok(Outcome::Dropped(job.id));
        }

        let answered = self.answer(&job).await;

        loop {
            let result = self
                .client
                .finish(
                    &job.id,
                    &answered.conversation_llm,
                    &answered.conversation,
                    &answered.source,
                )
                .await;
            match result {
                Ok(()) => {
                    backoff.reset();
                    return Ok(Outcome::Finished(job.id));
                }
                Err(e @ ClientError::Rejected(_)) => return Err(e.into()),
                Err(ClientError::Transport(msg)) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %msg, delay_secs = delay.as_secs_f64(), "finish failed, backing off");
                    self.sleeper.sleep(delay).await;
                }
                Err(ClientError::Status { status, body }) if status >= 500 => {
                    let delay = backoff.next_delay();
                    tracing::warn!(status, %body, delay_secs = delay.as_secs_f64(), "finish failed, backing off");
                    self.sleeper.sleep(delay).await;
                }
                Err(e) => {
                    backoff.reset();
                    tracing::error!(session = %job.id, error = %e, "finish rejected, result lost");
                    return Ok(Outcome::Undelivered(job.id));
                }
            }
        }
    }

    /// Claim and handle exactly one job, polling as long as it takes.
    pub async fn run_once(&self, backoff: &mut Backoff) -> Result<Outcome> {
        let (_keep, mut never) = watch::channel(false);
        match self.next_job(backoff, &mut never).await? {
            Some(job) => self.handle(job, backoff).await,
            None => bail!("job polling stopped without a job"),
        }
    }

    /// Process jobs until `shutdown` flips to `true`. A claimed job is
    /// always completed before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut backoff = Backoff::new(self.policy);
        tracing::info!(model = self.model.model_name(), "worker started");
        while let Some(job) = self.next_job(&mut backoff, &mut shutdown).await? {
            self.handle(job, &mut backoff).await?;
        }
        tracing::info!("worker stopped");
        Ok(())
    }
}

/// Signal liveness every `interval` until `shutdown` flips to `true`.
pub async fn heartbeat_loop(
    client: Arc<dyn QueueClient>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut backoff = Backoff::new(policy);
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let delay = match client.heartbeat().await {
            Ok(()) => {
                backoff.reset();
                interval
            }
            Err(e @ ClientError::Rejected(_)) => return Err(e.into()),
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(error = %e, delay_secs = delay.as_secs_f64(), "heartbeat failed, backing off");
                delay
            }
        };
        tokio::select! {
            _ = sleeper.sleep(delay) => {}
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

// ============ Entry points ============

fn build_client(
    config: &Config,
    pool: &sqlx::SqlitePool,
    direct: bool,
) -> Result<Arc<dyn QueueClient>> {
    if direct {
        let queue = JobQueue::new(
            Arc::new(SqliteStore::new(pool.clone())),
            config.queue.claim_order,
        );
        Ok(Arc::new(DirectQueueClient::new(queue)))
    } else {
        Ok(Arc::new(HttpQueueClient::from_config(config)?))
    }
}

/// Run `worker` with a heartbeat task alongside until `shutdown` flips to
/// `true`.
///
/// A heartbeat that stops with an error logs it and requests shutdown, so
/// the worker finishes its current job. The worker's own error wins over the
/// heartbeat's.
pub async fn run_supervised(
    worker: &Worker,
    client: Arc<dyn QueueClient>,
    sleeper: Arc<dyn Sleeper>,
    config: &WorkerConfig,
    shutdown: Arc<watch::Sender<bool>>,
) -> Result<()> {
    let worker_shutdown = shutdown.subscribe();
    let beat = heartbeat_loop(
        client,
        sleeper,
        RetryPolicy::from_config(config),
        config.heartbeat_interval(),
        shutdown.subscribe(),
    );
    let heartbeat = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = beat.await;
            if let Err(e) = &result {
                tracing::error!(error = %format!("{:#}", e), "heartbeat stopped, shutting down worker");
                shutdown.send_replace(true);
            }
            result
        })
    };

    let run_result = worker.run(worker_shutdown).await;
    shutdown.send_replace(true);

    let heartbeat_result = match heartbeat.await {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("heartbeat task failed: {}", e)),
    };
    run_result.and(heartbeat_result)
}

/// `stuart worker`: answer jobs until Ctrl-C. The heartbeat runs alongside
/// on its own task so liveness is reported during long completions.
pub async fn run_worker(config: &Config, direct: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let client = build_client(config, &pool, direct)?;
    let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);

    let retriever = Retriever::new(
        Arc::new(SqliteStore::new(pool.clone())),
        embedding::create_provider(&config.embedding)?,
        &config.retrieval,
    );
    let model = llm::create_chat_model(&config.llm)?;

    let (shutdown_tx, _) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested, finishing current job");
            }
            shutdown_tx.send_replace(true);
        });
    }

    let worker = Worker::new(config, client.clone(), sleeper.clone(), retriever, model);
    let result = run_supervised(&worker, client, sleeper, &config.worker, shutdown_tx).await;

    pool.close().await;
    result
}

/// `stuart heartbeat`: report liveness only, for deployments where the
/// worker process is supervised separately.
pub async fn run_heartbeat(config: &Config, direct: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let client = build_client(config, &pool, direct)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    let result = heartbeat_loop(
        client,
        Arc::new(TokioSleeper),
        RetryPolicy::from_config(&config.worker),
        config.worker.heartbeat_interval(),
        shutdown_rx,
    )
    .await;

    pool.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClaimOrder, RetrievalConfig};
    use crate::embedding::EmbeddingProvider;
    use crate::models::{Chunk, JobState};
    use crate::store::{ChunkStore, InMemoryStore};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    /// Replays scripted claim responses, then reports an empty queue.
    #[derive(Default)]
    struct ScriptedClient {
        claims: Mutex<VecDeque<Result<Option<Job>, ClientError>>>,
        finished: Mutex<Vec<(String, Answered)>>,
    }

    #[async_trait]
    impl QueueClient for ScriptedClient {
        async fn claim(&self) -> Result<Option<Job>, ClientError> {
            self.claims.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }

        async fn finish(
            &self,
            id: &str,
            conversation_llm: &[ChatMessage],
            conversation: &[String],
            source: &[String],
        ) -> Result<(), ClientError> {
            self.finished.lock().unwrap().push((
                id.to_string(),
                Answered {
                    conversation_llm: conversation_llm.to_vec(),
                    conversation: conversation.to_vec(),
                    source: source.to_vec(),
                },
            ));
            Ok(())
        }

        async fn heartbeat(&self) -> Result<(), ClientError> {
            Ok(())
        }
    }

    struct UnitEmbedder;

    #[async_trait]
    impl EmbeddingProvider for UnitEmbedder {
        fn model_name(&self) -> &str {
            "unit"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct EchoModel;

    #[async_trait]
    impl ChatModel for EchoModel {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            Ok(format!("answer #{}", messages.len()))
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ChatModel for FailingModel {
        fn model_name(&self) -> &str {
            "failing"
        }
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
            bail!("context window exceeded")
        }
    }

    fn test_config() -> Config {
        toml::from_str("[db]\npath = \"unused.sqlite\"\n").unwrap()
    }

    async fn worker(
        client: Arc<dyn QueueClient>,
        sleeper: Arc<RecordingSleeper>,
        model: Arc<dyn ChatModel>,
    ) -> Worker {
        Worker::new(&test_config(), client, sleeper, retriever().await, model)
    }

    async fn retriever() -> Retriever {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_chunks(&[Chunk {
                tag: "wiki".into(),
                file_name: "parking.md".into(),
                start_pos: 120,
                end_pos: 140,
                body: "Parking is free.".into(),
                embedding: vec![1.0, 0.0],
            }])
            .await
            .unwrap();
        Retriever::new(store, Arc::new(UnitEmbedder), &RetrievalConfig::default())
    }

    fn first_job() -> Job {
        Job {
            id: "s1".into(),
            conversation: vec!["Is parking free?".into()],
            conversation_llm: vec![],
            source: vec![],
        }
    }

    #[test]
    fn test_backoff_sequence_and_reset() {
        let mut backoff = Backoff::new(RetryPolicy::default());
        let secs: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 32, 32, 32]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_claim() {
        assert!(parse_claim(" {} \n").unwrap().is_none());
        assert!(matches!(parse_claim("<html>"), Err(ClientError::Malformed(_))));
        let body = r#"{"uuid":"u","conversation":"[\"q\"]","conversation_llm":"[]","source":"[]"}"#;
        let job = parse_claim(body).unwrap().unwrap();
        assert_eq!(job.conversation, vec!["q".to_string()]);
    }

    #[tokio::test]
    async fn test_poll_backoff_then_job() {
        let client = Arc::new(ScriptedClient::default());
        {
            let mut claims = client.claims.lock().unwrap();
            for _ in 0..3 {
                claims.push_back(Err(ClientError::Transport("refused".into())));
            }
            claims.push_back(Ok(None));
            claims.push_back(Err(ClientError::Transport("refused".into())));
            claims.push_back(Err(ClientError::Malformed("garbage".into())));
            claims.push_back(Ok(Some(first_job())));
        }
        let sleeper = Arc::new(RecordingSleeper::default());
        let w = worker(client.clone(), sleeper.clone(), Arc::new(EchoModel)).await;

        let mut backoff = Backoff::new(RetryPolicy::default());
        let outcome = w.run_once(&mut backoff).await.unwrap();
        assert_eq!(outcome, Outcome::Finished("s1".into()));

        let slept: Vec<u64> = sleeper
            .slept
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(slept, vec![2000, 4000, 8000, 1000, 2000, 5000]);
    }

    #[tokio::test]
    async fn test_first_turn_answer() {
        let client = Arc::new(ScriptedClient::default());
        client.claims.lock().unwrap().push_back(Ok(Some(first_job())));
        let w = worker(client.clone(), Arc::default(), Arc::new(EchoModel)).await;

        w.run_once(&mut Backoff::new(RetryPolicy::default()))
            .await
            .unwrap();
        let finished = client.finished.lock().unwrap();
        let (id, answered) = &finished[0];
        assert_eq!(id, "s1");
        assert_eq!(answered.conversation, vec!["Is parking free?", "answer #2"]);
        assert_eq!(answered.conversation_llm.len(), 3);
        assert_eq!(answered.conversation_llm[2], ChatMessage::assistant("answer #2"));
        assert_eq!(
            answered.source,
            vec!["Source: document parking.md (tag: wiki) at offset 120 chars."]
        );
    }

    #[tokio::test]
    async fn test_inference_failure_uses_sentinel() {
        let client = Arc::new(ScriptedClient::default());
        client.claims.lock().unwrap().push_back(Ok(Some(first_job())));
        let w = worker(client.clone(), Arc::default(), Arc::new(FailingModel)).await;

        w.run_once(&mut Backoff::new(RetryPolicy::default()))
            .await
            .unwrap();
        let finished = client.finished.lock().unwrap();
        assert_eq!(finished[0].1.conversation[1], LLM_FAILURE_ANSWER);
        assert_eq!(
            finished[0].1.conversation_llm.last(),
            Some(&ChatMessage::assistant(LLM_FAILURE_ANSWER))
        );
    }

    #[tokio::test]
    async fn test_invalid_job_dropped() {
        let client = Arc::new(ScriptedClient::default());
        let mut bad = first_job();
        bad.conversation.push("second question".into());
        client.claims.lock().unwrap().push_back(Ok(Some(bad)));
        let w = worker(client.clone(), Arc::default(), Arc::new(EchoModel)).await;

        let outcome = w
            .run_once(&mut Backoff::new(RetryPolicy::default()))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Dropped("s1".into()));
        assert!(client.finished.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_secret_is_fatal() {
        let client = Arc::new(ScriptedClient::default());
        client
            .claims
            .lock()
            .unwrap()
            .push_back(Err(ClientError::Rejected("front end".into())));
        let w = worker(client, Arc::default(), Arc::new(EchoModel)).await;
        let err = w
            .run_once(&mut Backoff::new(RetryPolicy::default()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let client = Arc::new(ScriptedClient::default());
        let w = worker(client, Arc::default(), Arc::new(EchoModel)).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        w.run(rx).await.unwrap();
    }

    /// Commits each claim to the queue, then takes `delay` to answer.
    struct SlowClaimClient {
        inner: DirectQueueClient,
        delay: Duration,
    }

    #[async_trait]
    impl QueueClient for SlowClaimClient {
        async fn claim(&self) -> Result<Option<Job>, ClientError> {
            let job = self.inner.claim().await?;
            tokio::time::sleep(self.delay).await;
            Ok(job)
        }

        async fn finish(
            &self,
            id: &str,
            conversation_llm: &[ChatMessage],
            conversation: &[String],
            source: &[String],
        ) -> Result<(), ClientError> {
            self.inner
                .finish(id, conversation_llm, conversation, source)
                .await
        }

        async fn heartbeat(&self) -> Result<(), ClientError> {
            self.inner.heartbeat().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_claim_finishes_job() {
        let queue = JobQueue::new(Arc::new(InMemoryStore::new()), ClaimOrder::Newest);
        let id = queue.create_session().await.unwrap();
        queue.enqueue(&id, "Is parking free?").await.unwrap();

        let client = Arc::new(SlowClaimClient {
            inner: DirectQueueClient::new(queue.clone()),
            delay: Duration::from_millis(200),
        });
        let w = worker(client, Arc::default(), Arc::new(EchoModel)).await;

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send_replace(true);
        });
        w.run(rx).await.unwrap();

        let session = queue.session(&id).await.unwrap().unwrap();
        assert_eq!(session.state, JobState::WaitForQuestion);
        assert_eq!(session.conversation, vec!["Is parking free?", "answer #2"]);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_idle_poll() {
        let client = Arc::new(ScriptedClient::default());
        let w = Worker::new(
            &test_config(),
            client,
            Arc::new(TokioSleeper),
            retriever().await,
            Arc::new(EchoModel),
        );
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send_replace(true);
        });
        tokio::time::timeout(Duration::from_millis(900), w.run(rx))
            .await
            .expect("poll sleep should end on shutdown")
            .unwrap();
    }

    /// Answers claims with an empty queue and refuses every heartbeat.
    struct RejectingHeartbeat;

    #[async_trait]
    impl QueueClient for RejectingHeartbeat {
        async fn claim(&self) -> Result<Option<Job>, ClientError> {
            Ok(None)
        }
        async fn finish(
            &self,
            _id: &str,
            _conversation_llm: &[ChatMessage],
            _conversation: &[String],
            _source: &[String],
        ) -> Result<(), ClientError> {
            Ok(())
        }
        async fn heartbeat(&self) -> Result<(), ClientError> {
            Err(ClientError::Rejected("front end".into()))
        }
    }

    #[tokio::test]
    async fn test_supervised_worker_stops_when_heartbeat_fails() {
        let config = test_config();
        let client: Arc<dyn QueueClient> = Arc::new(RejectingHeartbeat);
        let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);
        let w = Worker::new(
            &config,
            client.clone(),
            sleeper.clone(),
            retriever().await,
            Arc::new(EchoModel),
        );
        let (tx, _) = watch::channel(false);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_supervised(&w, client, sleeper, &config.worker, Arc::new(tx)),
        )
        .await
        .expect("worker should stop once the heartbeat fails");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("rejected"), "got: {}", err);
    }

    /// Flips `shutdown` once `limit` sleeps have been requested.
    struct StoppingSleeper {
        slept: Mutex<Vec<Duration>>,
        limit: usize,
        shutdown: watch::Sender<bool>,
    }

    #[async_trait]
    impl Sleeper for StoppingSleeper {
        async fn sleep(&self, duration: Duration) {
            let mut slept = self.slept.lock().unwrap();
            slept.push(duration);
            if slept.len() >= self.limit {
                let _ = self.shutdown.send(true);
            }
        }
    }

    #[tokio::test]
    async fn test_heartbeat_loop_backs_off_and_stops() {
        struct FlakyHeartbeat {
            replies: Mutex<VecDeque<Result<(), ClientError>>>,
        }

        #[async_trait]
        impl QueueClient for FlakyHeartbeat {
            async fn claim(&self) -> Result<Option<Job>, ClientError> {
                Ok(None)
            }
            async fn finish(
                &self,
                _id: &str,
                _conversation_llm: &[ChatMessage],
                _conversation: &[String],
                _source: &[String],
            ) -> Result<(), ClientError> {
                Ok(())
            }
            async fn heartbeat(&self) -> Result<(), ClientError> {
                self.replies.lock().unwrap().pop_front().unwrap_or(Ok(()))
            }
        }

        let client = Arc::new(FlakyHeartbeat {
            replies: Mutex::new(VecDeque::from(vec![
                Err(ClientError::Transport("down".into())),
                Err(ClientError::Status {
                    status: 502,
                    body: "bad gateway".into(),
                }),
                Ok(()),
            ])),
        });
        let (tx, rx) = watch::channel(false);
        let sleeper = Arc::new(StoppingSleeper {
            slept: Mutex::new(Vec::new()),
            limit: 4,
            shutdown: tx,
        });

        heartbeat_loop(
            client,
            sleeper.clone(),
            RetryPolicy::default(),
            Duration::from_millis(2500),
            rx,
        )
        .await
        .unwrap();

        let slept: Vec<u64> = sleeper
            .slept
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(slept, vec![2000, 4000, 2500, 2500]);
    }

    #[tokio::test]
    async fn test_heartbeat_loop_rejected_is_fatal() {
        let (_tx, rx) = watch::channel(false);
        let result = heartbeat_loop(
            Arc::new(RejectingHeartbeat),
            Arc::new(RecordingSleeper::default()),
            RetryPolicy::default(),
            Duration::from_millis(2500),
            rx,
        )
        .await;
        assert!(result.is_err());
    }
}
