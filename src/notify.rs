//! The notifier capability (§6.B) the core depends on but never delivers
//! mail/webhooks itself. HMAC signing is grounded on the same
//! `Hmac<Sha256>` pattern used for GitHub webhook signatures in the
//! webhook-trigger example in the retrieval pack.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{JobservError, Result};
use crate::store::models::Build;

type HmacSha256 = Hmac<Sha256>;

/// `X-JobServ-Sig: sha256:<hex>` = `HMAC_SHA256(secret, body)` (§6.B).
pub fn sign_webhook_body(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| JobservError::Unexpected(anyhow::anyhow!(e)))?;
    mac.update(body);
    Ok(format!("sha256:{:x}", mac.finalize().into_bytes()))
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_build_complete_email(&self, build: &Build, recipients: &[String]) -> Result<()>;
    async fn notify_build_complete_webhook(
        &self,
        build: &Build,
        url: &str,
        hmac_secret: &str,
    ) -> Result<()>;
    async fn notify_surge_started(&self, tag: &str) -> Result<String>;
    async fn notify_surge_ended(&self, tag: &str, prior_id: &str) -> Result<()>;
    async fn notify_run_terminated(&self, run_id: i64, cutoff: &str) -> Result<()>;
}

/// A notifier that only logs — the default for development and for
/// deployments that don't want mail/webhook delivery wired in.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify_build_complete_email(&self, build: &Build, recipients: &[String]) -> Result<()> {
        log::info!(
            "build {} (project {}) complete, status {}: would email {:?}",
            build.build_id,
            build.project_id,
            build.status,
            recipients
        );
        Ok(())
    }

    async fn notify_build_complete_webhook(
        &self,
        build: &Build,
        url: &str,
        hmac_secret: &str,
    ) -> Result<()> {
        let body = serde_json::to_vec(&serde_json::json!({
            "project_id": build.project_id,
            "build_id": build.build_id,
            "status": build.status,
        }))
        .map_err(|e| JobservError::Unexpected(e.into()))?;
        let sig = sign_webhook_body(hmac_secret, &body)?;
        log::info!("would POST build-complete webhook to {url} with X-JobServ-Sig: {sig}");
        Ok(())
    }

    async fn notify_surge_started(&self, tag: &str) -> Result<String> {
        log::warn!("surge started for host tag {tag}");
        Ok(uuid_like_id())
    }

    async fn notify_surge_ended(&self, tag: &str, prior_id: &str) -> Result<()> {
        log::info!("surge ended for host tag {tag} (notification {prior_id})");
        Ok(())
    }

    async fn notify_run_terminated(&self, run_id: i64, cutoff: &str) -> Result<()> {
        log::warn!("run {run_id} terminated past cutoff {cutoff}");
        Ok(())
    }
}

fn uuid_like_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_for_same_input() {
        let a = sign_webhook_body("secret", b"body").unwrap();
        let b = sign_webhook_body("secret", b"body").unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
    }

    #[test]
    fn signature_differs_for_different_secrets() {
        let a = sign_webhook_body("secret-a", b"body").unwrap();
        let b = sign_webhook_body("secret-b", b"body").unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn logging_notifier_round_trips_surge_lifecycle() {
        let notifier = LoggingNotifier;
        let id = notifier.notify_surge_started("amd64").await.unwrap();
        assert_eq!(id.len(), 16);
        notifier.notify_surge_ended("amd64", &id).await.unwrap();
    }
}
