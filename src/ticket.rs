//! Ticket issuer: bounded, at-most-once-per-user ticket issuance over
//! sharded Redis counters.
//!
//! Each shard stores a `ticket_request_counter` and one lock key per user
//! id. Issuance never contends on the shared counter: the request blindly
//! INCRs it inside an optimistic transaction and checks the cap afterwards,
//! so the counter may transiently exceed the cap but issued tickets never
//! do. The per-user lock key plus WATCH keeps every user to at most one
//! ticket no matter how many requests race.
//!
//! The transaction, per request:
//!
//! 1. `WATCH ticket_requested_by_user_id_$ID` — abort if written externally
//! 2. `GET` it; already present means the user was ticketed or refused before
//! 3. `MULTI; INCR ticket_request_counter; SET <user key> yes; EXEC`
//! 4. issue iff the post-increment counter is within the cap
//!
//! A nil `EXEC` reply means a concurrent request touched the watched key
//! first; that request owns the user's one attempt, so this one reports
//! `Conflict` (not an error, and not a ticket).
use crate::config::TicketIssuerConfig;
use crate::error::{MeridianError, MeridianResult};
use crate::network::{Connection, Listener, Message};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Deadline for a single issuance request.
const REQUEST_DEADLINE: Duration = Duration::from_secs(3);

/// Per-shard counter of ticket requests.
const COUNTER_KEY: &str = "ticket_request_counter";

/// The business outcome of an issuance attempt. Only `Issued` carries a
/// ticket; every other outcome is a normal refusal, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketOutcome {
    /// A ticket was issued to this user.
    Issued,
    /// This user id already spent its one request.
    AlreadyRequested,
    /// The shard's ticket cap was already consumed.
    SoldOut,
    /// A concurrent request for the same user won the transaction.
    Conflict,
}

impl TicketOutcome {
    /// Whether this outcome carries a ticket.
    pub fn ticketed(self) -> bool {
        matches!(self, TicketOutcome::Issued)
    }
}

/// Stateless issuer in front of the Redis shards.
pub struct TicketIssuer {
    config: TicketIssuerConfig,
    shards: Vec<redis::Client>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl TicketIssuer {
    /// Build an issuer from its config. Shard clients are created eagerly
    /// but connect lazily.
    pub fn new(config: TicketIssuerConfig) -> MeridianResult<Self> {
        config.validate()?;
        let shards = config
            .redis_shard_urls
            .iter()
            .map(|url| redis::Client::open(url.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            shards,
            started_at: Instant::now(),
            shutdown_tx,
        })
    }

    /// Attempt to issue a ticket to `user_id`, within the request deadline.
    pub async fn issue_ticket(&self, user_id: u64) -> MeridianResult<TicketOutcome> {
        match tokio::time::timeout(REQUEST_DEADLINE, self.try_issue(user_id)).await {
            Ok(result) => result,
            Err(_) => Err(MeridianError::Timeout(REQUEST_DEADLINE)),
        }
    }

    async fn try_issue(&self, user_id: u64) -> MeridianResult<TicketOutcome> {
        // WATCH is connection-scoped, so the transaction needs a dedicated
        // connection rather than a multiplexed one.
        let shard = &self.shards[self.shard_index(user_id)];
        let mut conn = shard.get_async_connection().await?;

        let user_key = format!("ticket_requested_by_user_id_{user_id}");

        redis::cmd("WATCH")
            .arg(&user_key)
            .query_async::<_, ()>(&mut conn)
            .await?;

        let existing: Option<String> = redis::cmd("GET")
            .arg(&user_key)
            .query_async(&mut conn)
            .await?;
        if existing.is_some() {
            redis::cmd("UNWATCH").query_async::<_, ()>(&mut conn).await?;
            tracing::debug!(user_id, "rejected duplicate ticket request");
            return Ok(TicketOutcome::AlreadyRequested);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("INCR").arg(COUNTER_KEY);
        pipe.cmd("SET").arg(&user_key).arg("yes").ignore();
        let exec: Option<(i64,)> = pipe.query_async(&mut conn).await?;

        match exec {
            // EXEC returned nil: the watched key changed underneath us.
            None => {
                tracing::debug!(user_id, "ticket transaction aborted by concurrent request");
                Ok(TicketOutcome::Conflict)
            }
            Some((requests,)) if requests > self.config.max_tickets_per_shard => {
                tracing::info!(user_id, "no tickets left");
                Ok(TicketOutcome::SoldOut)
            }
            Some(_) => {
                tracing::info!(user_id, "ticketed");
                Ok(TicketOutcome::Issued)
            }
        }
    }

    /// User ids are pinned to shards by modulo, so every request for a user
    /// lands on the shard holding its lock key.
    fn shard_index(&self, user_id: u64) -> usize {
        (user_id % self.shards.len() as u64) as usize
    }

    /// Accept and serve connections until [`stop`](Self::stop) is called.
    pub async fn serve(self: Arc<Self>, listener: Listener) -> MeridianResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tracing::info!(address = %listener.local_addr(), "ticket issuer listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok(conn) => {
                            let issuer = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(err) = issuer.handle_connection(conn).await {
                                    tracing::debug!("connection error: {err}");
                                }
                            });
                        }
                        Err(err) => tracing::warn!("failed to accept connection: {err}"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        Ok(())
    }

    /// Signal the accept loop to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn handle_connection(&self, mut conn: Connection) -> MeridianResult<()> {
        loop {
            let message = match conn.receive().await {
                Ok(message) => message,
                Err(_) => break, // connection closed
            };
            let response = self.handle_message(message).await;
            conn.send(&response).await?;
        }
        Ok(())
    }

    async fn handle_message(&self, message: Message) -> Message {
        match message {
            Message::TicketHealth => Message::TicketHealthAck {
                uptime: self.started_at.elapsed(),
            },

            Message::IssueTicket { user_id } => match self.issue_ticket(user_id).await {
                Ok(outcome) => Message::IssueTicketAck {
                    ticketed: outcome.ticketed(),
                },
                Err(err) => {
                    tracing::error!(user_id, "unexpected error issuing ticket: {err}");
                    Message::Error {
                        message: err.to_string(),
                    }
                }
            },

            other => Message::Error {
                message: format!("unexpected request: {other:?}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer_with_shards(count: usize) -> TicketIssuer {
        let config = TicketIssuerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            max_tickets_per_shard: 3,
            redis_shard_urls: (0..count)
                .map(|i| format!("redis://127.0.0.1:6379/{i}"))
                .collect(),
        };
        TicketIssuer::new(config).unwrap()
    }

    #[test]
    fn test_user_ids_pin_to_shards_by_modulo() {
        let issuer = issuer_with_shards(4);
        assert_eq!(issuer.shard_index(0), 0);
        assert_eq!(issuer.shard_index(5), 1);
        assert_eq!(issuer.shard_index(7), 3);
        // Same user id always lands on the same shard.
        assert_eq!(issuer.shard_index(42), issuer.shard_index(42));
    }

    #[test]
    fn test_only_issued_carries_a_ticket() {
        assert!(TicketOutcome::Issued.ticketed());
        assert!(!TicketOutcome::AlreadyRequested.ticketed());
        assert!(!TicketOutcome::SoldOut.ticketed());
        assert!(!TicketOutcome::Conflict.ticketed());
    }

    #[test]
    fn test_empty_shard_list_is_rejected() {
        let config = TicketIssuerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            max_tickets_per_shard: 3,
            redis_shard_urls: vec![],
        };
        assert!(TicketIssuer::new(config).is_err());
    }
}
