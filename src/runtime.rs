//! Process-wide dependency aggregate, standing in for the teacher's
//! single-process `AppState`: one Postgres pool, one event bus, one job
//! queue, one Gmail API client, one OAuth token client, and the in-process
//! IDLE watcher map, shared across every request/worker task.

use std::sync::Arc;

use crate::collaborators::{BlobStore, MessageParser, PushFanout, ThreadingCollaborator};
use crate::config::Settings;
use crate::events::EventBus;
use crate::gmail::api::GmailApiClient;
use crate::gmail::sync::GmailSyncDeps;
use crate::idle::{IdleWatcherDeps, IdleWatcherMap};
use crate::imap::sync::ImapSyncDeps;
use crate::jobs::JobQueue;
use crate::oauth::token_manager::{GoogleTokenClient, HttpGoogleTokenClient};
use crate::send::SendPipelineDeps;
use crate::storage::Storage;

/// Collaborators a concrete deployment must supply; this crate only
/// defines the seams (§1, §10).
pub struct RuntimeCollaborators {
    pub message_parser: Arc<dyn MessageParser>,
    pub blob_store: Arc<dyn BlobStore>,
    pub threader: Arc<dyn ThreadingCollaborator>,
    pub push_fanout: Option<Arc<dyn PushFanout>>,
}

pub struct Runtime {
    pub settings: Arc<Settings>,
    pub storage: Storage,
    pub http: reqwest::Client,
    pub event_bus: Arc<EventBus>,
    pub job_queue: Arc<JobQueue>,
    pub token_client: Arc<dyn GoogleTokenClient>,
    pub gmail_api: Arc<GmailApiClient>,
    pub idle_watchers: Arc<IdleWatcherMap>,
}

impl Runtime {
    pub async fn new(
        settings: Settings,
        push_fanout: Option<Arc<dyn PushFanout>>,
    ) -> anyhow::Result<Self> {
        let settings = Arc::new(settings);
        let storage = Storage::connect(&settings.database_url).await?;
        let pool = storage.pool().clone();

        let http = reqwest::Client::builder()
            .user_agent("inletd/0.1")
            .build()?;

        let event_bus = Arc::new(EventBus::new(pool.clone(), push_fanout));
        event_bus.spawn_listener();

        let job_queue = Arc::new(JobQueue::new(pool.clone()));

        let token_client: Arc<dyn GoogleTokenClient> = Arc::new(HttpGoogleTokenClient {
            http: http.clone(),
            token_url: settings.google.token_url.clone(),
        });

        let gmail_api = Arc::new(GmailApiClient::new(http.clone()));
        let idle_watchers = Arc::new(IdleWatcherMap::new());

        Ok(Self {
            settings,
            storage,
            http,
            event_bus,
            job_queue,
            token_client,
            gmail_api,
            idle_watchers,
        })
    }

    pub fn gmail_sync_deps(&self, collaborators: &RuntimeCollaborators) -> GmailSyncDeps {
        GmailSyncDeps {
            pool: self.storage.pool().clone(),
            event_bus: self.event_bus.clone(),
            job_queue: self.job_queue.clone(),
            gmail_api: self.gmail_api.clone(),
            token_client: self.token_client.clone(),
            message_parser: collaborators.message_parser.clone(),
            blob_store: collaborators.blob_store.clone(),
            threader: collaborators.threader.clone(),
            intervals: self.settings.intervals.clone(),
            bootstrap_metadata_only: self.settings.gmail_bootstrap_metadata_only,
        }
    }

    pub fn imap_sync_deps(&self, collaborators: &RuntimeCollaborators) -> ImapSyncDeps {
        ImapSyncDeps {
            pool: self.storage.pool().clone(),
            event_bus: self.event_bus.clone(),
            job_queue: self.job_queue.clone(),
            token_client: self.token_client.clone(),
            message_parser: collaborators.message_parser.clone(),
            blob_store: collaborators.blob_store.clone(),
            threader: collaborators.threader.clone(),
            intervals: self.settings.intervals.clone(),
            source_fetch_batch_size: self.settings.concurrency.source_fetch_batch_size as u32,
        }
    }

    pub fn idle_watcher_deps(&self, collaborators: &RuntimeCollaborators) -> Arc<IdleWatcherDeps> {
        Arc::new(IdleWatcherDeps {
            pool: self.storage.pool().clone(),
            event_bus: self.event_bus.clone(),
            token_client: self.token_client.clone(),
            gmail_deps: Arc::new(self.gmail_sync_deps(collaborators)),
            imap_deps: Arc::new(self.imap_sync_deps(collaborators)),
            intervals: self.settings.intervals.clone(),
        })
    }

    pub fn send_pipeline_deps(&self) -> SendPipelineDeps {
        SendPipelineDeps {
            pool: self.storage.pool().clone(),
            token_client: self.token_client.clone(),
            gmail_api: self.gmail_api.clone(),
            jobs: self.job_queue.clone(),
            settings: self.settings.clone(),
        }
    }
}
