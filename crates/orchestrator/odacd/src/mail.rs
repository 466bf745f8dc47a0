//! Mail account storage and the outbound spool. The SMTP/IMAP servers are
//! external; they read accounts from `mail.json` and drain the spool.

use std::num::NonZeroU32;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use ring::pbkdf2;
use tracing::info;
use uuid::Uuid;

use od_config::{ConfigStore, MailAccount, Module};

const PBKDF2_ITERATIONS: NonZeroU32 = NonZeroU32::new(100_000).unwrap();
const CREDENTIAL_LEN: usize = 32;

pub struct MailManager {
    store: Arc<ConfigStore>,
}

impl MailManager {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, address: &str, password: &str) -> Result<()> {
        let address = address.trim().to_lowercase();
        if !address.contains('@') || password.len() < 8 {
            bail!("invalid address or password too short");
        }
        {
            let tree = self.store.read().await;
            if tree.mail.accounts.contains_key(&address) {
                bail!("mail account already exists: {address}");
            }
        }

        let (salt, hash) = hash_password(password);
        self.store
            .update(Module::Mail, |tree| {
                tree.mail.accounts.insert(
                    address.clone(),
                    MailAccount { password_hash: hash, salt, created: Utc::now() },
                );
            })
            .await;
        info!(address, "Mail account created");
        Ok(())
    }

    pub async fn set_password(&self, address: &str, password: &str) -> Result<()> {
        let address = address.trim().to_lowercase();
        if password.len() < 8 {
            bail!("password too short");
        }
        let (salt, hash) = hash_password(password);
        let updated = self
            .store
            .update(Module::Mail, |tree| {
                match tree.mail.accounts.get_mut(&address) {
                    Some(account) => {
                        account.password_hash = hash;
                        account.salt = salt;
                        true
                    }
                    None => false,
                }
            })
            .await;
        if !updated {
            bail!("mail account not found: {address}");
        }
        Ok(())
    }

    pub async fn delete(&self, address: &str) -> Result<()> {
        let address = address.trim().to_lowercase();
        let removed = self
            .store
            .update(Module::Mail, |tree| tree.mail.accounts.remove(&address))
            .await;
        if removed.is_none() {
            bail!("mail account not found: {address}");
        }
        info!(address, "Mail account deleted");
        Ok(())
    }

    pub async fn list(&self) -> Vec<String> {
        self.store.read().await.mail.accounts.keys().cloned().collect()
    }

    pub fn verify_password(&self, account: &MailAccount, password: &str) -> bool {
        let Ok(salt) = hex::decode(&account.salt) else {
            return false;
        };
        let Ok(stored) = hex::decode(&account.password_hash) else {
            return false;
        };
        pbkdf2::verify(
            pbkdf2::PBKDF2_HMAC_SHA256,
            PBKDF2_ITERATIONS,
            &salt,
            password.as_bytes(),
            &stored,
        )
        .is_ok()
    }

    /// Queue an outbound message; the external MTA drains the spool.
    pub async fn send(&self, from: &str, to: &str, subject: &str, body: &str) -> Result<String> {
        let spool = self.store.paths().mail_spool_dir();
        std::fs::create_dir_all(&spool).context("spool dir")?;
        let id = Uuid::new_v4().to_string();
        let message = serde_json::json!({
            "id": id,
            "from": from,
            "to": to,
            "subject": subject,
            "body": body,
            "queued": Utc::now().to_rfc3339(),
        });
        let path = spool.join(format!("{id}.json"));
        std::fs::write(&path, serde_json::to_string_pretty(&message)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(to, id, "Mail queued");
        Ok(id)
    }

    /// Watchdog hook: the spool directory must exist for the MTA.
    pub async fn check(&self) {
        let _ = std::fs::create_dir_all(self.store.paths().mail_spool_dir());
    }
}

fn hash_password(password: &str) -> (String, String) {
    use rand::Rng;
    let mut salt = [0u8; 16];
    rand::rng().fill(&mut salt);
    let mut hash = [0u8; CREDENTIAL_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        &salt,
        password.as_bytes(),
        &mut hash,
    );
    (hex::encode(salt), hex::encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use od_common::{EventBus, OdacPaths};

    async fn manager() -> (tempfile::TempDir, MailManager) {
        let dir = tempfile::tempdir().unwrap();
        let paths = OdacPaths::at(dir.path().to_path_buf());
        paths.ensure().unwrap();
        let store = Arc::new(ConfigStore::load(paths, Arc::new(EventBus::new())));
        (dir, MailManager::new(store))
    }

    #[tokio::test]
    async fn account_lifecycle_and_password_verify() {
        let (_dir, mail) = manager().await;
        mail.create("user@example.com", "s3cretpass").await.unwrap();
        assert_eq!(mail.list().await, vec!["user@example.com"]);
        assert!(mail.create("user@example.com", "s3cretpass").await.is_err());
        assert!(mail.create("not-an-address", "s3cretpass").await.is_err());
        assert!(mail.create("x@y.com", "short").await.is_err());

        let account = mail
            .store
            .read()
            .await
            .mail
            .accounts
            .get("user@example.com")
            .cloned()
            .unwrap();
        assert!(mail.verify_password(&account, "s3cretpass"));
        assert!(!mail.verify_password(&account, "wrong"));

        mail.set_password("user@example.com", "newpassword").await.unwrap();
        let account = mail
            .store
            .read()
            .await
            .mail
            .accounts
            .get("user@example.com")
            .cloned()
            .unwrap();
        assert!(mail.verify_password(&account, "newpassword"));

        mail.delete("user@example.com").await.unwrap();
        assert!(mail.list().await.is_empty());
    }

    #[tokio::test]
    async fn send_writes_spool_entry() {
        let (dir, mail) = manager().await;
        let id = mail
            .send("noreply@example.com", "user@other.org", "hi", "body")
            .await
            .unwrap();
        let path = dir.path().join(format!("mail/spool/{id}.json"));
        let raw = std::fs::read_to_string(path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["to"], "user@other.org");
    }
}
