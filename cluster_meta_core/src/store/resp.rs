//! Metadata store over a RESP connection

use std::collections::HashMap;
use std::time::Duration;

use super::{ExecOutcome, MetaConnection, MetaStore};
use crate::error::{MetaError, Result};
use crate::model::Address;
use crate::resp::{RespConnection, RespValue};

pub struct RespMetaStore {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl RespMetaStore {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
        }
    }
}

#[async_trait::async_trait]
impl MetaStore for RespMetaStore {
    async fn connect(&self, addr: &Address) -> Result<Box<dyn MetaConnection>> {
        let conn = RespConnection::connect(&addr.to_string(), self.connect_timeout, self.command_timeout).await?;
        tracing::debug!("connected to metadata store at {}", addr);
        Ok(Box::new(RespMetaConnection { conn }))
    }
}

pub struct RespMetaConnection {
    conn: RespConnection,
}

impl RespMetaConnection {
    async fn call(&mut self, args: &[&str]) -> Result<RespValue> {
        match self.conn.command(args).await? {
            RespValue::Error(e) => Err(MetaError::Store(format!("{} failed on {}: {}", args[0], self.conn.peer(), e))),
            reply => Ok(reply),
        }
    }

    async fn expect_status(&mut self, args: &[&str], accepted: &[&str]) -> Result<()> {
        let reply = self.call(args).await?;
        match reply.as_str() {
            Some(status) if accepted.contains(&status) => Ok(()),
            _ => Err(MetaError::Protocol(format!("unexpected reply to {}: {:?}", args[0], reply))),
        }
    }
}

#[async_trait::async_trait]
impl MetaConnection for RespMetaConnection {
    async fn hgetall(&mut self, key: &str) -> Result<HashMap<String, String>> {
        let reply = self.call(&["HGETALL", key]).await?;
        if !matches!(reply, RespValue::Array(_)) {
            return Err(MetaError::Protocol(format!("unexpected reply to HGETALL: {:?}", reply)));
        }
        Ok(reply.into_pairs().into_iter().collect())
    }

    async fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<()> {
        match self.call(&["HSET", key, field, value]).await? {
            RespValue::Integer(_) => Ok(()),
            other => Err(MetaError::Protocol(format!("unexpected reply to HSET: {:?}", other))),
        }
    }

    async fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        self.expect_status(&["RENAME", src, dst], &["OK", "QUEUED"]).await
    }

    async fn watch(&mut self, key: &str) -> Result<()> {
        self.expect_status(&["WATCH", key], &["OK"]).await
    }

    async fn multi(&mut self) -> Result<()> {
        self.expect_status(&["MULTI"], &["OK"]).await
    }

    async fn exec(&mut self) -> Result<ExecOutcome> {
        match self.call(&["EXEC"]).await? {
            RespValue::NullArray => Ok(ExecOutcome::Aborted),
            RespValue::Array(results) => {
                if let Some(RespValue::Error(e)) = results.iter().find(|r| matches!(r, RespValue::Error(_))) {
                    return Err(MetaError::Store(format!("queued command failed: {}", e)));
                }
                Ok(ExecOutcome::Committed)
            }
            other => Err(MetaError::Protocol(format!("unexpected reply to EXEC: {:?}", other))),
        }
    }

    async fn discard(&mut self) -> Result<()> {
        self.expect_status(&["DISCARD"], &["OK"]).await
    }
}
