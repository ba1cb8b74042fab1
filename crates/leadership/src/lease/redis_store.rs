use std::time::Duration;

use eyre::{WrapErr as _, eyre};
use redis::{Script, aio::ConnectionManager};
use tandem_telemetry_util::display_duration;

use super::LeaseStore;

/// Key of the lease shared by the whole cluster.
pub const LEASE_KEY: &str = "tandem_leader_election";

const RENEW: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// The lease as a Redis key holding the holder's id, with a TTL.
pub struct RedisLeaseStore {
    connection: ConnectionManager,
    key: String,
    response_timeout: Duration,
    renew: Script,
    release: Script,
}

impl RedisLeaseStore {
    pub fn new(connection: ConnectionManager, response_timeout: Duration) -> Self {
        Self::with_key(connection, LEASE_KEY, response_timeout)
    }

    pub fn with_key(
        connection: ConnectionManager,
        key: impl Into<String>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            key: key.into(),
            response_timeout,
            renew: Script::new(RENEW),
            release: Script::new(RELEASE),
        }
    }

    async fn bounded<T>(
        &self,
        request: impl Future<Output = redis::RedisResult<T>>,
    ) -> eyre::Result<T> {
        match tokio::time::timeout(self.response_timeout, request).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(eyre!(
                "redis did not answer within {}",
                display_duration(self.response_timeout)
            )),
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis().max(1)).unwrap_or(u64::MAX)
}

impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> eyre::Result<bool> {
        let mut connection = self.connection.clone();
        let mut set = redis::cmd("SET");
        set.arg(&self.key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl));
        let reply: Option<String> = self
            .bounded(set.query_async(&mut connection))
            .await
            .wrap_err("failed acquiring leadership lease")?;
        Ok(reply.is_some())
    }

    async fn renew(&self, holder: &str, ttl: Duration) -> eyre::Result<bool> {
        let mut connection = self.connection.clone();
        let mut invocation = self.renew.key(&self.key);
        invocation.arg(holder).arg(millis(ttl));
        let renewed: i64 = self
            .bounded(invocation.invoke_async(&mut connection))
            .await
            .wrap_err("failed renewing leadership lease")?;
        Ok(renewed == 1)
    }

    async fn release(&self, holder: &str) -> eyre::Result<bool> {
        let mut connection = self.connection.clone();
        let mut invocation = self.release.key(&self.key);
        invocation.arg(holder);
        let released: i64 = self
            .bounded(invocation.invoke_async(&mut connection))
            .await
            .wrap_err("failed releasing leadership lease")?;
        Ok(released == 1)
    }
}
