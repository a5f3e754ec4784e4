//! The queue processor: campaign lifecycle and the delivery loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::control::QueueStatus;
use super::progress::{Progress, ProgressFeed};
use super::run_state::RunState;
use crate::clock::Clock;
use crate::delivery::{DeliveryChannel, DeliveryError, DeliveryReceipt};
use crate::error::{PacerError, Result};
use crate::model::{
    AnalyticsEvent, Campaign, CampaignId, CampaignStatus, EventKind, Message, MessageStatus,
    Recipient, RecipientId,
};
use crate::ratelimit::RateLimiter;
use crate::render::{PlaceholderRenderer, TemplateRenderer};
use crate::retry::RetryPolicy;
use crate::store::{CampaignStore, Outcome, StateStore};

/// Why a loop run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Completed,
    DailyCapReached,
    Interrupted,
}

/// Drains one campaign at a time through the rate limiter and the
/// delivery channel.
///
/// At most one loop task exists per processor. `pause` and `stop` are
/// cooperative: they raise a flag the loop checks between messages, so an
/// in-flight delivery always finishes.
pub struct QueueProcessor {
    store: Arc<dyn CampaignStore>,
    channel: Arc<dyn DeliveryChannel>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    renderer: Arc<dyn TemplateRenderer>,
    clock: Arc<dyn Clock>,
    persistence: Arc<dyn StateStore>,
    progress: ProgressFeed,
    run: Mutex<RunState>,
    stop_flag: Mutex<Arc<AtomicBool>>,
    /// The loop task and the campaign it drains.
    task: Mutex<Option<(CampaignId, JoinHandle<()>)>>,
    /// Serializes control operations with the loop's own transitions.
    control: tokio::sync::Mutex<()>,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        channel: Arc<dyn DeliveryChannel>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        persistence: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            store,
            channel,
            limiter,
            retry: RetryPolicy::default(),
            renderer: Arc::new(PlaceholderRenderer),
            clock,
            persistence,
            progress: ProgressFeed::default(),
            run: Mutex::new(RunState::default()),
            stop_flag: Mutex::new(Arc::new(AtomicBool::new(false))),
            task: Mutex::new(None),
            control: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Restore persisted run-state and make the processor shareable.
    ///
    /// An interrupted run is reported but not relaunched; see
    /// [`recover_and_resume`](Self::recover_and_resume).
    pub async fn open(self) -> Result<Arc<Self>> {
        let mut restored = RunState::load(self.persistence.as_ref()).await?;
        if restored.is_processing {
            warn!(
                campaign_id = ?restored.current_campaign_id,
                last_processed_at = ?restored.last_processed_at,
                "Previous run was interrupted; call recover_and_resume to continue"
            );
        }
        // No loop survives a restart.
        restored.is_processing = false;
        *self.run.lock() = restored;
        Ok(Arc::new(self))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn store(&self) -> &Arc<dyn CampaignStore> {
        &self.store
    }

    pub fn run_state(&self) -> RunState {
        self.run.lock().clone()
    }

    /// Subscribe to progress notifications.
    pub fn progress(&self) -> broadcast::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn progress_feed(&self) -> &ProgressFeed {
        &self.progress
    }

    pub fn status(&self) -> QueueStatus {
        let run = self.run.lock().clone();
        QueueStatus {
            is_processing: run.is_processing,
            current_campaign_id: run.current_campaign_id,
            rate_limiter: self.limiter.status(),
        }
    }

    /// Wait for the current loop task, if any, to exit.
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some((_, handle)) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Queue loop task panicked");
            }
        }
    }

    // ---- campaign lifecycle -------------------------------------------

    #[instrument(skip(self, template))]
    pub async fn create_campaign(&self, name: &str, template: &str) -> Result<Campaign> {
        let campaign = Campaign::new(name, template, self.clock.now());
        self.store.insert_campaign(campaign.clone()).await?;
        info!(campaign_id = %campaign.id, "Campaign created");
        Ok(campaign)
    }

    pub async fn add_recipient(&self, recipient: Recipient) -> Result<RecipientId> {
        let id = recipient.id;
        self.store.insert_recipient(recipient).await?;
        Ok(id)
    }

    pub async fn get_campaign(&self, id: CampaignId) -> Result<Campaign> {
        self.store
            .get_campaign(id)
            .await?
            .ok_or_else(|| PacerError::not_found("campaign", id))
    }

    pub async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        self.store.list_campaigns().await
    }

    #[instrument(skip(self), fields(campaign_id = %id))]
    pub async fn delete_campaign(&self, id: CampaignId) -> Result<()> {
        let _control = self.control.lock().await;
        let is_current = self.run.lock().current_campaign_id == Some(id);
        let processing = is_current && self.run.lock().is_processing;
        if processing || self.draining_campaign() == Some(id) {
            return Err(PacerError::invalid_state("delete", "campaign is processing"));
        }
        if !self.store.delete_campaign(id).await? {
            return Err(PacerError::not_found("campaign", id));
        }
        if is_current {
            self.update_run_state(|run| run.current_campaign_id = None).await?;
        }
        info!("Campaign deleted");
        Ok(())
    }

    /// Create one message per recipient, in the given order.
    ///
    /// Unknown recipients are skipped. Blocked recipients get a `skipped`
    /// message that does not count towards the campaign total.
    #[instrument(skip(self, recipient_ids), fields(campaign_id = %campaign_id, recipients = recipient_ids.len()))]
    pub async fn enqueue(&self, campaign_id: CampaignId, recipient_ids: &[RecipientId]) -> Result<u64> {
        let _control = self.control.lock().await;
        let campaign = self.get_campaign(campaign_id).await?;
        if !matches!(campaign.status, CampaignStatus::Draft | CampaignStatus::Paused) {
            return Err(PacerError::invalid_state(
                "enqueue",
                format!("campaign is {}", campaign.status),
            ));
        }

        let base = self.store.messages_for_campaign(campaign_id).await?.len() as u64;
        let mut messages = Vec::with_capacity(recipient_ids.len());
        let mut counted = 0;

        for recipient_id in recipient_ids {
            let Some(recipient) = self.store.get_recipient(*recipient_id).await? else {
                warn!(recipient_id = %recipient_id, "Skipping unknown recipient");
                continue;
            };
            let content = self.renderer.render(&campaign.template, &recipient);
            let priority = base + messages.len() as u64;
            let mut message = Message::new(campaign_id, &recipient, content, priority);
            if recipient.blocked {
                message.status = MessageStatus::Skipped;
                message.error = Some("recipient is blocked".to_string());
            } else {
                counted += 1;
            }
            messages.push(message);
        }

        let skipped = messages.len() as u64 - counted;
        self.store
            .enqueue_messages(campaign_id, messages, self.clock.now())
            .await?;

        info!(enqueued = counted, skipped = skipped, "Messages enqueued");
        Ok(counted)
    }

    // ---- control surface ----------------------------------------------

    /// Start draining a draft campaign.
    #[instrument(skip(self), fields(campaign_id = %campaign_id))]
    pub async fn start(self: &Arc<Self>, campaign_id: CampaignId) -> Result<()> {
        let _control = self.control.lock().await;
        let campaign = self.get_campaign(campaign_id).await?;
        if campaign.status != CampaignStatus::Draft {
            return Err(PacerError::invalid_state(
                "start",
                format!("campaign is {}", campaign.status),
            ));
        }
        self.ensure_idle(campaign_id).await?;

        let now = self.clock.now();
        self.store
            .set_campaign_status(campaign_id, CampaignStatus::Active, now)
            .await?;
        self.update_run_state(|run| {
            run.is_processing = true;
            run.current_campaign_id = Some(campaign_id);
            run.last_processed_at = Some(now);
        })
        .await?;

        self.spawn_loop(campaign_id);
        info!(pending = campaign.pending, "Campaign started");
        Ok(())
    }

    /// Pause the active campaign after its in-flight message.
    #[instrument(skip(self))]
    pub async fn pause(&self) -> Result<()> {
        let _control = self.control.lock().await;
        let campaign = self.current_campaign("pause").await?;
        if !campaign.status.can_transition_to(CampaignStatus::Paused) {
            return Err(PacerError::invalid_state(
                "pause",
                format!("campaign is {}", campaign.status),
            ));
        }

        self.signal_stop();
        self.store
            .set_campaign_status(campaign.id, CampaignStatus::Paused, self.clock.now())
            .await?;
        self.update_run_state(|run| run.is_processing = false).await?;
        info!(campaign_id = %campaign.id, "Campaign paused");
        Ok(())
    }

    /// Relaunch the loop for the paused current campaign.
    #[instrument(skip(self))]
    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        let _control = self.control.lock().await;
        let campaign = self.current_campaign("resume").await?;
        if campaign.status != CampaignStatus::Paused {
            return Err(PacerError::invalid_state(
                "resume",
                format!("campaign is {}", campaign.status),
            ));
        }
        self.ensure_idle(campaign.id).await?;
        self.repair_interrupted(campaign.id).await?;

        let now = self.clock.now();
        self.store
            .set_campaign_status(campaign.id, CampaignStatus::Active, now)
            .await?;
        self.update_run_state(|run| {
            run.is_processing = true;
            run.last_processed_at = Some(now);
        })
        .await?;

        self.spawn_loop(campaign.id);
        info!(campaign_id = %campaign.id, "Campaign resumed");
        Ok(())
    }

    /// End the current campaign; undelivered messages stay pending.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let _control = self.control.lock().await;
        let campaign = self.current_campaign("stop").await?;
        if !campaign.status.can_transition_to(CampaignStatus::Completed) {
            return Err(PacerError::invalid_state(
                "stop",
                format!("campaign is {}", campaign.status),
            ));
        }

        self.signal_stop();
        let now = self.clock.now();
        self.store
            .set_campaign_status(campaign.id, CampaignStatus::Completed, now)
            .await?;
        self.update_run_state(|run| {
            run.is_processing = false;
            run.current_campaign_id = None;
            run.last_processed_at = Some(now);
        })
        .await?;
        info!(
            campaign_id = %campaign.id,
            pending = campaign.pending,
            "Campaign stopped"
        );
        Ok(())
    }

    /// Relaunch a campaign whose loop was lost to a restart.
    ///
    /// Messages caught in `queued` go back to `pending`. Messages caught in
    /// `sending` may already have been delivered, so they are failed rather
    /// than sent twice.
    #[instrument(skip(self))]
    pub async fn recover_and_resume(self: &Arc<Self>) -> Result<Option<CampaignId>> {
        let _control = self.control.lock().await;
        let Some(campaign_id) = self.run.lock().current_campaign_id else {
            debug!("No campaign to recover");
            return Ok(None);
        };
        if let Some(draining) = self.draining_campaign() {
            return Err(PacerError::AlreadyProcessing(draining));
        }

        let Some(campaign) = self.store.get_campaign(campaign_id).await? else {
            warn!(campaign_id = %campaign_id, "Recorded campaign no longer exists");
            self.update_run_state(|run| *run = RunState::default()).await?;
            return Ok(None);
        };
        if campaign.status != CampaignStatus::Active {
            info!(
                campaign_id = %campaign_id,
                status = %campaign.status,
                "Recorded campaign is not active, nothing to recover"
            );
            return Ok(None);
        }

        self.repair_interrupted(campaign_id).await?;
        let now = self.clock.now();
        self.update_run_state(|run| {
            run.is_processing = true;
            run.last_processed_at = Some(now);
        })
        .await?;
        self.spawn_loop(campaign_id);
        info!(campaign_id = %campaign_id, "Recovered interrupted campaign");
        Ok(Some(campaign_id))
    }

    // ---- loop ---------------------------------------------------------

    fn spawn_loop(self: &Arc<Self>, campaign_id: CampaignId) {
        let stop = Arc::new(AtomicBool::new(false));
        *self.stop_flag.lock() = stop.clone();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_loop(campaign_id, stop).await });
        *self.task.lock() = Some((campaign_id, handle));
    }

    fn signal_stop(&self) {
        self.stop_flag.lock().store(true, Ordering::SeqCst);
    }

    /// The campaign whose loop task has not exited yet.
    fn draining_campaign(&self) -> Option<CampaignId> {
        self.task
            .lock()
            .as_ref()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| *id)
    }

    async fn run_loop(self: Arc<Self>, campaign_id: CampaignId, stop: Arc<AtomicBool>) {
        info!(campaign_id = %campaign_id, "Queue loop started");
        match self.drain(campaign_id, &stop).await {
            Ok(exit) => info!(campaign_id = %campaign_id, exit = ?exit, "Queue loop exited"),
            Err(err) => {
                error!(campaign_id = %campaign_id, error = %err, "Queue loop failed");
                self.fail_campaign(campaign_id, &err, &stop).await;
            }
        }
    }

    async fn drain(&self, campaign_id: CampaignId, stop: &AtomicBool) -> Result<LoopExit> {
        loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(LoopExit::Interrupted);
            }

            if !self.limiter.can_send_now() {
                info!(campaign_id = %campaign_id, "Daily limit reached, pausing campaign");
                return self.pause_for_daily_cap(campaign_id, stop).await;
            }

            let Some(mut message) = self.store.next_pending_message(campaign_id).await? else {
                return self.complete_campaign(campaign_id, stop).await;
            };

            self.transition(&mut message, MessageStatus::Queued).await?;

            match self.limiter.await_slot().await {
                Ok(()) => {}
                Err(PacerError::RateLimitExceeded { limit }) => {
                    info!(campaign_id = %campaign_id, limit = limit, "Daily limit hit while waiting, pausing campaign");
                    self.transition(&mut message, MessageStatus::Pending).await?;
                    return self.pause_for_daily_cap(campaign_id, stop).await;
                }
                Err(e) => return Err(e),
            }

            self.transition(&mut message, MessageStatus::Sending).await?;
            debug!(message_id = %message.id, address = %message.address, "Dispatching message");

            match self.channel.deliver(&message.address, &message.content).await {
                Ok(receipt) => self.on_delivered(message, receipt).await?,
                Err(error) => self.on_delivery_failed(message, error).await?,
            }

            self.notify_progress(campaign_id).await?;

            let now = self.clock.now();
            self.update_run_state(|run| run.last_processed_at = Some(now))
                .await?;
        }
    }

    async fn transition(&self, message: &mut Message, next: MessageStatus) -> Result<()> {
        if !message.status.can_transition_to(next) {
            return Err(PacerError::invalid_state(
                "move message",
                format!("{} -> {}", message.status, next),
            ));
        }
        message.status = next;
        self.store.update_message(message).await
    }

    async fn on_delivered(&self, mut message: Message, receipt: DeliveryReceipt) -> Result<()> {
        let now = self.clock.now();
        message.provider_id = receipt.provider_id;
        message.sent_at = Some(now);
        self.transition(&mut message, MessageStatus::Sent).await?;
        self.store
            .record_outcome(message.campaign_id, Outcome::Sent, now)
            .await?;

        match self.store.mark_contacted(message.recipient_id, now).await {
            Ok(()) => {}
            Err(PacerError::NotFound { .. }) => {
                warn!(recipient_id = %message.recipient_id, "Recipient vanished before contact was recorded");
            }
            Err(e) => return Err(e),
        }

        self.store
            .record_event(AnalyticsEvent::message(&message, EventKind::MessageSent, now))
            .await?;
        info!(
            message_id = %message.id,
            address = %message.address,
            "Message sent"
        );
        Ok(())
    }

    async fn on_delivery_failed(&self, mut message: Message, error: DeliveryError) -> Result<()> {
        let now = self.clock.now();
        let attempts_made = message.retry_attempt + 1;
        message.error = Some(error.reason.clone());
        message.failed_at = Some(now);

        if self.retry.should_retry(&error, attempts_made) {
            message.retry_attempt += 1;
            self.transition(&mut message, MessageStatus::Pending).await?;
            warn!(
                message_id = %message.id,
                attempt = attempts_made,
                max_attempts = self.retry.max_attempts(),
                error = %error,
                "Delivery failed, will retry"
            );
            return Ok(());
        }

        self.transition(&mut message, MessageStatus::Failed).await?;
        self.store
            .record_outcome(message.campaign_id, Outcome::Failed, now)
            .await?;
        self.store
            .record_event(AnalyticsEvent::message(&message, EventKind::MessageFailed, now))
            .await?;
        warn!(
            message_id = %message.id,
            address = %message.address,
            attempts = attempts_made,
            error = %error,
            "Delivery failed permanently"
        );
        Ok(())
    }

    async fn notify_progress(&self, campaign_id: CampaignId) -> Result<()> {
        let campaign = self.get_campaign(campaign_id).await?;
        self.progress.publish(Progress::from(&campaign));
        Ok(())
    }

    async fn complete_campaign(&self, campaign_id: CampaignId, stop: &AtomicBool) -> Result<LoopExit> {
        let _control = self.control.lock().await;
        if stop.load(Ordering::SeqCst) {
            return Ok(LoopExit::Interrupted);
        }

        let now = self.clock.now();
        let campaign = self
            .store
            .set_campaign_status(campaign_id, CampaignStatus::Completed, now)
            .await?;
        self.store
            .record_event(AnalyticsEvent::campaign(campaign_id, EventKind::CampaignCompleted, now))
            .await?;
        self.update_run_state(|run| {
            run.is_processing = false;
            run.current_campaign_id = None;
            run.last_processed_at = Some(now);
        })
        .await?;

        info!(
            campaign_id = %campaign_id,
            sent = campaign.sent,
            failed = campaign.failed,
            "Campaign completed"
        );
        Ok(LoopExit::Completed)
    }

    async fn pause_for_daily_cap(&self, campaign_id: CampaignId, stop: &AtomicBool) -> Result<LoopExit> {
        let _control = self.control.lock().await;
        if stop.load(Ordering::SeqCst) {
            return Ok(LoopExit::Interrupted);
        }

        self.store
            .set_campaign_status(campaign_id, CampaignStatus::Paused, self.clock.now())
            .await?;
        self.update_run_state(|run| run.is_processing = false).await?;
        Ok(LoopExit::DailyCapReached)
    }

    /// Best effort: the store may be the thing that failed.
    async fn fail_campaign(&self, campaign_id: CampaignId, cause: &PacerError, stop: &AtomicBool) {
        let _control = self.control.lock().await;
        let now = self.clock.now();

        match self.store.get_campaign(campaign_id).await {
            Ok(Some(campaign)) if campaign.status.can_transition_to(CampaignStatus::Failed) => {
                if let Err(e) = self
                    .store
                    .set_campaign_status(campaign_id, CampaignStatus::Failed, now)
                    .await
                {
                    error!(campaign_id = %campaign_id, error = %e, "Could not persist campaign failure");
                }
                let mut event = AnalyticsEvent::campaign(campaign_id, EventKind::CampaignFailed, now);
                event.error = Some(cause.to_string());
                if let Err(e) = self.store.record_event(event).await {
                    warn!(error = %e, "Could not record campaign failure event");
                }
            }
            Ok(_) => {}
            Err(e) => error!(campaign_id = %campaign_id, error = %e, "Could not load failed campaign"),
        }

        if !stop.load(Ordering::SeqCst) {
            if let Err(e) = self.update_run_state(|run| run.is_processing = false).await {
                error!(error = %e, "Could not persist run-state");
            }
        }
    }

    // ---- helpers ------------------------------------------------------

    async fn current_campaign(&self, operation: &'static str) -> Result<Campaign> {
        let current = self.run.lock().current_campaign_id;
        match current {
            Some(id) => self.get_campaign(id).await,
            None => Err(PacerError::invalid_state(operation, "no campaign is running")),
        }
    }

    /// Refuse to launch while any loop or other active campaign exists.
    async fn ensure_idle(&self, campaign_id: CampaignId) -> Result<()> {
        // A stopped loop may still be finishing its in-flight send.
        if let Some(draining) = self.draining_campaign() {
            return Err(PacerError::AlreadyProcessing(draining));
        }
        let run = self.run.lock().clone();
        if run.is_processing {
            return Err(PacerError::AlreadyProcessing(
                run.current_campaign_id.unwrap_or(campaign_id),
            ));
        }
        let active = self.store.campaigns_by_status(CampaignStatus::Active).await?;
        if let Some(other) = active.iter().find(|c| c.id != campaign_id) {
            return Err(PacerError::AlreadyProcessing(other.id));
        }
        Ok(())
    }

    async fn repair_interrupted(&self, campaign_id: CampaignId) -> Result<()> {
        let now = self.clock.now();
        for mut message in self.store.messages_for_campaign(campaign_id).await? {
            match message.status {
                MessageStatus::Queued => {
                    debug!(message_id = %message.id, "Returning claimed message to pending");
                    self.transition(&mut message, MessageStatus::Pending).await?;
                }
                MessageStatus::Sending => {
                    warn!(
                        message_id = %message.id,
                        address = %message.address,
                        "Delivery outcome unknown after interruption, marking failed"
                    );
                    message.error = Some("interrupted during delivery".to_string());
                    message.failed_at = Some(now);
                    self.transition(&mut message, MessageStatus::Failed).await?;
                    self.store
                        .record_outcome(campaign_id, Outcome::Failed, now)
                        .await?;
                    self.store
                        .record_event(AnalyticsEvent::message(&message, EventKind::MessageFailed, now))
                        .await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn update_run_state<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut RunState),
    {
        let snapshot = {
            let mut run = self.run.lock();
            mutate(&mut run);
            run.clone()
        };
        snapshot.save(self.persistence.as_ref()).await
    }
}
