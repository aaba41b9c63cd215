//! Opskit subs: keep a Graph-style change-notification subscription fresh.
//!
//! One invocation discovers the subscription (direct id or list-and-filter),
//! then either creates it, renews it, or leaves it alone depending on how
//! close its expiration sits to the renewal threshold. Nothing is cached
//! across invocations; the external service owns the resource.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use opskit_core::EnvironmentContext;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Platform ceiling on subscription lifetime for group resources.
pub const MAX_LIFETIME_MINUTES: i64 = 4230;

/// Domain object the subscription watches.
pub const WATCHED_RESOURCE: &str = "groups";

/// Prefix marking Event Grid partner-topic delivery in a notification URL.
pub const EVENT_GRID_PREFIX: &str = "EventGrid:";

/// A change-notification subscription as the service reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub resource: String,
    pub notification_url: String,
    pub expiration_date_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_state: Option<String>,
}

/// Creation request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    pub change_type: String,
    pub resource: String,
    pub notification_url: String,
    pub expiration_date_time: DateTime<Utc>,
    pub client_state: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SubsError {
    #[error("config: {0}")]
    Config(String),
    #[error("auth: {0}")]
    Auth(String),
    #[error("not_found_or_foreign: {0}")]
    NotFoundOrForeign(String),
    #[error("transient: {0}")]
    Transient(String),
}

/// Typed settings resolved once at startup from the environment context.
#[derive(Debug, Clone)]
pub struct Settings {
    pub renewal_threshold_hours: i64,
    pub target_subscription_id: String,
    pub resource_group: String,
    pub partner_topic: String,
    pub direct_resource_id: Option<String>,
    pub region: String,
    pub mi_client_id: Option<String>,
}

impl Settings {
    pub fn resolve(ctx: &EnvironmentContext) -> Result<Self, SubsError> {
        let threshold = ctx.get_or("OPSKIT_RENEWAL_THRESHOLD_HOURS", "24");
        let renewal_threshold_hours = threshold.parse::<i64>().map_err(|_| {
            SubsError::Config(format!("OPSKIT_RENEWAL_THRESHOLD_HOURS not a number: {}", threshold))
        })?;
        let target_subscription_id = ctx
            .get("OPSKIT_TARGET_SUBSCRIPTION_ID")
            .ok_or_else(|| SubsError::Config("OPSKIT_TARGET_SUBSCRIPTION_ID is required".into()))?
            .to_string();
        Ok(Self {
            renewal_threshold_hours,
            target_subscription_id,
            resource_group: ctx.get_or("OPSKIT_RESOURCE_GROUP", "groupchangefunction"),
            partner_topic: ctx.get_or("OPSKIT_PARTNER_TOPIC", "default"),
            direct_resource_id: ctx.get("OPSKIT_DIRECT_RESOURCE_ID").map(|s| s.to_string()),
            region: ctx.get_or("OPSKIT_REGION", "centralus"),
            mi_client_id: ctx.get("OPSKIT_MI_CLIENT_ID").map(|s| s.to_string()),
        })
    }

    /// Event Grid partner-topic delivery target for this configuration.
    pub fn notification_url(&self) -> String {
        format!(
            "{}?azuresubscriptionid={}&resourcegroup={}&partnertopic={}&location={}",
            EVENT_GRID_PREFIX,
            self.target_subscription_id,
            self.resource_group,
            self.partner_topic,
            self.region
        )
    }
}

/// Subscription service seam. Production talks HTTP via
/// [`GraphSubscriptions`]; tests use an in-memory fake.
#[async_trait::async_trait]
pub trait SubscriptionsApi: Send + Sync {
    async fn list(&self) -> Result<Vec<Subscription>, SubsError>;
    /// `Ok(None)` when the id does not resolve to a subscription.
    async fn get(&self, id: &str) -> Result<Option<Subscription>, SubsError>;
    async fn create(&self, req: &NewSubscription) -> Result<Subscription, SubsError>;
    async fn renew(&self, id: &str, expiration: DateTime<Utc>) -> Result<Subscription, SubsError>;
}

/// Terminal outcome of one lifecycle pass.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Outcome {
    Created { expiration: DateTime<Utc>, dry_run: bool },
    Renewed { id: String, expiration: DateTime<Utc>, dry_run: bool },
    RenewalSkipped { id: String, hours_left: f64 },
    RenewalFailed { id: String, cause: String, gone_or_foreign: bool },
}

/// One pass of the lifecycle state machine. Discovery and creation failures
/// propagate as errors (the invocation is unrecoverable before any mutation
/// succeeds); a renewal failure is caught, classified, and reported as an
/// [`Outcome::RenewalFailed`]. With `dry_run` no mutating call is issued on
/// any path.
pub async fn ensure_fresh(
    api: &dyn SubscriptionsApi,
    settings: &Settings,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<Outcome, SubsError> {
    let existing = match settings.direct_resource_id.as_deref() {
        Some(id) => {
            info!(id = %id, "fetching subscription by configured id");
            api.get(id).await?
        }
        None => {
            let all = api.list().await?;
            info!(total = all.len(), "listed subscriptions");
            all.into_iter().find(|s| {
                s.notification_url.starts_with(EVENT_GRID_PREFIX) && s.resource == WATCHED_RESOURCE
            })
        }
    };

    let new_expiration = now + Duration::minutes(MAX_LIFETIME_MINUTES);
    match existing {
        None => {
            info!(resource = WATCHED_RESOURCE, expiration = %new_expiration, dry_run, "no matching subscription; creating");
            if dry_run {
                return Ok(Outcome::Created { expiration: new_expiration, dry_run: true });
            }
            let req = NewSubscription {
                change_type: "updated,deleted".into(),
                resource: WATCHED_RESOURCE.into(),
                notification_url: settings.notification_url(),
                expiration_date_time: new_expiration,
                client_state: Uuid::new_v4().to_string(),
            };
            let created = api.create(&req).await?;
            metrics::counter!("subscriptions_created_total", 1u64);
            Ok(Outcome::Created { expiration: created.expiration_date_time, dry_run: false })
        }
        Some(sub) => {
            let hours_left = (sub.expiration_date_time - now).num_seconds() as f64 / 3600.0;
            info!(id = %sub.id, hours_left, threshold = settings.renewal_threshold_hours, "subscription found");
            if hours_left >= settings.renewal_threshold_hours as f64 {
                return Ok(Outcome::RenewalSkipped { id: sub.id, hours_left });
            }
            if dry_run {
                return Ok(Outcome::Renewed { id: sub.id, expiration: new_expiration, dry_run: true });
            }
            match api.renew(&sub.id, new_expiration).await {
                Ok(renewed) => {
                    metrics::counter!("subscriptions_renewed_total", 1u64);
                    Ok(Outcome::Renewed {
                        id: renewed.id,
                        expiration: renewed.expiration_date_time,
                        dry_run: false,
                    })
                }
                Err(SubsError::NotFoundOrForeign(msg)) => {
                    warn!(id = %sub.id, error = %msg, "subscription gone, expired, or owned elsewhere; not retrying");
                    metrics::counter!("subscription_renewal_failures_total", 1u64);
                    Ok(Outcome::RenewalFailed { id: sub.id, cause: msg, gone_or_foreign: true })
                }
                // every renewal failure is reported, never propagated; the
                // invocation still completes with an outcome
                Err(other) => {
                    let msg = other.to_string();
                    warn!(id = %sub.id, error = %msg, "renewal call failed; not retrying");
                    metrics::counter!("subscription_renewal_failures_total", 1u64);
                    Ok(Outcome::RenewalFailed { id: sub.id, cause: msg, gone_or_foreign: false })
                }
            }
        }
    }
}

/// Classify a failed renewal. Structured status first; message inspection is
/// the fallback when no status is available. A renewal failure never aborts
/// the invocation, so every classification is non-fatal — a 401 here (a
/// token going stale mid-run) is reported like any other failed mutating
/// call.
pub fn renewal_failure(status: Option<u16>, body: &str) -> SubsError {
    match status {
        Some(401) => SubsError::Transient(format!("credentials rejected: {}", snippet(body))),
        Some(403) | Some(404) => SubsError::NotFoundOrForeign(format!(
            "status {}: {}",
            status.unwrap_or_default(),
            snippet(body)
        )),
        _ => {
            let lower = body.to_lowercase();
            if lower.contains("does not exist")
                || lower.contains("not found")
                || lower.contains("expired")
            {
                SubsError::NotFoundOrForeign(snippet(body).to_string())
            } else {
                SubsError::Transient(snippet(body).to_string())
            }
        }
    }
}

fn read_failure(status: u16, body: &str) -> SubsError {
    match status {
        401 | 403 => SubsError::Auth(format!("status {}: {}", status, snippet(body))),
        _ => SubsError::Transient(format!("status {}: {}", status, snippet(body))),
    }
}

fn snippet(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    body[..end].trim()
}

// ----------------- HTTP client -----------------

/// Graph-style REST client over `/subscriptions`.
pub struct GraphSubscriptions {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl GraphSubscriptions {
    /// Acquire credentials and build the client. Fails before any discovery
    /// when no usable credential source exists.
    pub async fn connect(ctx: &EnvironmentContext, settings: &Settings) -> Result<Self, SubsError> {
        let token = acquire_token(ctx, settings).await?;
        let base = ctx.get_or("OPSKIT_GRAPH_BASE", "https://graph.microsoft.com/v1.0");
        Ok(Self { http: reqwest::Client::new(), base, token })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/subscriptions{}", self.base, path)
    }
}

async fn acquire_token(ctx: &EnvironmentContext, settings: &Settings) -> Result<String, SubsError> {
    if let Some(token) = ctx.get("OPSKIT_GRAPH_TOKEN") {
        return Ok(token.to_string());
    }
    if ctx.is_automation_host() {
        let client_id = settings.mi_client_id.as_deref().ok_or_else(|| {
            SubsError::Auth("OPSKIT_MI_CLIENT_ID is required under the automation host".into())
        })?;
        let endpoint = ctx
            .get(opskit_core::IDENTITY_ENDPOINT_VAR)
            .ok_or_else(|| SubsError::Auth("identity endpoint missing".into()))?;
        let header = ctx
            .get("IDENTITY_HEADER")
            .ok_or_else(|| SubsError::Auth("IDENTITY_HEADER missing".into()))?;
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }
        let resp = reqwest::Client::new()
            .get(endpoint)
            .query(&[
                ("resource", "https://graph.microsoft.com"),
                ("client_id", client_id),
                ("api-version", "2019-08-01"),
            ])
            .header("X-IDENTITY-HEADER", header)
            .send()
            .await
            .map_err(|e| SubsError::Auth(format!("identity endpoint unreachable: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(SubsError::Auth(format!(
                "managed identity token request failed (status {}): {}",
                status,
                snippet(&body)
            )));
        }
        let tok: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SubsError::Auth(format!("bad token response: {}", e)))?;
        return Ok(tok.access_token);
    }
    Err(SubsError::Auth(
        "no credentials: set OPSKIT_GRAPH_TOKEN or run under an automation host".into(),
    ))
}

#[async_trait::async_trait]
impl SubscriptionsApi for GraphSubscriptions {
    async fn list(&self) -> Result<Vec<Subscription>, SubsError> {
        #[derive(Deserialize)]
        struct Page {
            value: Vec<Subscription>,
        }
        let resp = self
            .http
            .get(self.url(""))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SubsError::Transient(format!("list: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(read_failure(status, &body));
        }
        let page: Page = resp
            .json()
            .await
            .map_err(|e| SubsError::Transient(format!("list decode: {}", e)))?;
        Ok(page.value)
    }

    async fn get(&self, id: &str) -> Result<Option<Subscription>, SubsError> {
        let resp = self
            .http
            .get(self.url(&format!("/{}", id)))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SubsError::Transient(format!("get: {}", e)))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(read_failure(status, &body));
        }
        let sub = resp
            .json()
            .await
            .map_err(|e| SubsError::Transient(format!("get decode: {}", e)))?;
        Ok(Some(sub))
    }

    async fn create(&self, req: &NewSubscription) -> Result<Subscription, SubsError> {
        let resp = self
            .http
            .post(self.url(""))
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await
            .map_err(|e| SubsError::Transient(format!("create: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(read_failure(status, &body));
        }
        resp.json()
            .await
            .map_err(|e| SubsError::Transient(format!("create decode: {}", e)))
    }

    async fn renew(&self, id: &str, expiration: DateTime<Utc>) -> Result<Subscription, SubsError> {
        let body = serde_json::json!({ "expirationDateTime": expiration });
        let resp = self
            .http
            .patch(self.url(&format!("/{}", id)))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SubsError::Transient(format!("renew: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(renewal_failure(Some(status), &text));
        }
        resp.json()
            .await
            .map_err(|e| SubsError::Transient(format!("renew decode: {}", e)))
    }
}
