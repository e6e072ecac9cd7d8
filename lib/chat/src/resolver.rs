//! Finding or creating the conversation channel of a restaurant.

use crate::config::ChatConfig;
use crate::error::ChannelError;
use chrono::{Duration, Utc};
use rootcause::Report;
use servicebell_core::{ChannelMetadata, ChannelUrl, Identity, ParticipantId};
use servicebell_gateway::convert::{self, CUSTOM_TYPE_WELCOME};
use servicebell_gateway::{ConnectionGateway, CreateChannelParams, SendMessageParams};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Resolves the single active channel of a restaurant.
///
/// Candidates are the cached channel (while it is cached as open) and then
/// the canonical slot. The first one the provider reports as open is reused.
/// Terminal channels are never reused; a new timestamped channel replaces
/// them.
#[derive(Debug, Clone)]
pub struct ChannelResolver {
    gateway: Arc<ConnectionGateway>,
    support_participant: ParticipantId,
    welcome_text: String,
}

impl ChannelResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new(gateway: Arc<ConnectionGateway>, config: &ChatConfig) -> Self {
        Self {
            gateway,
            support_participant: config.support_participant(),
            welcome_text: config.welcome_text.clone(),
        }
    }

    /// Returns the open channel to use for `identity`, creating one if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if a lookup or the creation fails. A failed lookup
    /// never falls through to creation.
    #[instrument(skip_all, fields(restaurant_id = %identity.restaurant_id()))]
    pub async fn resolve(
        &self,
        identity: &Identity,
        cached: Option<&ChannelMetadata>,
    ) -> Result<ChannelMetadata, Report<ChannelError>> {
        let restaurant_id = identity.restaurant_id();
        let mut candidates = Vec::new();
        let mut skipped = Vec::new();

        if let Some(cached) = cached.filter(|c| c.restaurant_id == *restaurant_id) {
            if cached.is_active() {
                candidates.push(cached.channel_url.clone());
            } else {
                skipped.push(cached.channel_url.clone());
            }
        }
        let canonical = ChannelUrl::canonical(restaurant_id);
        if !candidates.contains(&canonical) {
            candidates.push(canonical);
        }

        for url in candidates {
            if skipped.contains(&url) {
                continue;
            }
            let remote = self.gateway.provider().get_channel(&url).await.map_err(|e| {
                ChannelError::LookupFailed {
                    channel_url: url.to_string(),
                    reason: e.to_string(),
                }
            })?;
            let Some(remote) = remote else {
                debug!(channel_url = %url, "no channel at candidate");
                continue;
            };
            match convert::channel_from_remote(&remote) {
                Ok(meta) if meta.is_active() => {
                    info!(channel_url = %url, "reusing open channel");
                    return Ok(meta);
                }
                Ok(meta) => {
                    debug!(channel_url = %url, status = %meta.status, "skipping terminal channel");
                    skipped.push(url);
                }
                Err(e) => {
                    warn!(channel_url = %url, error = %e, "skipping unreadable channel");
                    skipped.push(url);
                }
            }
        }

        self.create(identity, &skipped).await
    }

    async fn create(
        &self,
        identity: &Identity,
        skipped: &[ChannelUrl],
    ) -> Result<ChannelMetadata, Report<ChannelError>> {
        let restaurant_id = identity.restaurant_id();
        let mut created_at = Utc::now();
        let mut url = ChannelUrl::timestamped(restaurant_id, created_at);
        while skipped.contains(&url) {
            created_at += Duration::milliseconds(1);
            url = ChannelUrl::timestamped(restaurant_id, created_at);
        }

        let params = CreateChannelParams {
            channel_url: url.clone(),
            name: format!("Support: {}", identity.display_name()),
            member_ids: vec![
                identity.participant_id().clone(),
                self.support_participant.clone(),
            ],
            metadata: convert::channel_metadata_fields(restaurant_id),
        };
        let create_failed = |reason: String| ChannelError::CreateFailed {
            channel_url: url.to_string(),
            reason,
        };
        let remote = self
            .gateway
            .provider()
            .create_channel(params)
            .await
            .map_err(|e| create_failed(e.to_string()))?;
        let meta =
            convert::channel_from_remote(&remote).map_err(|e| create_failed(e.to_string()))?;
        info!(channel_url = %meta.channel_url, "created support channel");

        let welcome =
            SendMessageParams::text(self.welcome_text.as_str()).with_custom_type(CUSTOM_TYPE_WELCOME);
        if let Err(e) = self
            .gateway
            .provider()
            .send_message(&meta.channel_url, welcome)
            .await
        {
            warn!(channel_url = %meta.channel_url, error = %e, "failed to send welcome message");
        }

        Ok(meta)
    }
}
