//! Realtime broadcast hub.
//!
//! A single worker task owns the membership table. Everything else talks to
//! it through [`HubHandle`], which only sends commands over a channel.

use crate::config::HubConfig;
use crate::error::Error;
use crate::security::short_hash;
use log::{debug, info};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Characters of the member tag shown in front of each message
const TAG_PREFIX_LEN: usize = 4;

pub type MemberId = u64;

/// Identity of a joined member, returned by [`HubHandle::join`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberHandle {
    pub id: MemberId,
    pub tag: String,
}

impl MemberHandle {
    fn display_tag(&self) -> &str {
        self.tag.get(..TAG_PREFIX_LEN).unwrap_or(&self.tag)
    }
}

enum HubCommand {
    Join {
        outbound: mpsc::Sender<String>,
        reply: oneshot::Sender<MemberId>,
    },
    Leave {
        id: MemberId,
    },
    Publish {
        text: String,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable front door to the hub worker
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    member_buffer: usize,
}

impl HubHandle {
    /// Start the hub worker. It stops once every handle has been dropped.
    pub fn spawn(config: &HubConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let worker = HubWorker {
            members: HashMap::new(),
            next_id: 1,
        };
        let task = tokio::spawn(worker.run(rx));

        (
            Self {
                commands: tx,
                member_buffer: config.member_buffer.max(1),
            },
            task,
        )
    }

    /// Admit a new member identified by its network origin. The receiver
    /// yields every message published while the member is joined.
    pub async fn join(&self, origin: &str) -> Result<(MemberHandle, mpsc::Receiver<String>), Error> {
        let (outbound, inbound) = mpsc::channel(self.member_buffer);
        let (reply, id) = oneshot::channel();

        self.send(HubCommand::Join { outbound, reply }).await?;
        let id = id.await.map_err(|_| hub_gone())?;

        Ok((
            MemberHandle {
                id,
                tag: short_hash(origin),
            },
            inbound,
        ))
    }

    /// Remove a member. Leaving twice is harmless.
    pub async fn leave(&self, member: &MemberHandle) {
        let _ = self.send(HubCommand::Leave { id: member.id }).await;
    }

    /// Deliver `text` to every joined member, the sender included
    pub async fn publish(&self, from: &MemberHandle, text: &str) -> Result<(), Error> {
        let text = format!("[{}]: {}", from.display_tag(), text);
        self.send(HubCommand::Publish { text }).await
    }

    pub async fn member_count(&self) -> Result<usize, Error> {
        let (reply, count) = oneshot::channel();
        self.send(HubCommand::Count { reply }).await?;
        count.await.map_err(|_| hub_gone())
    }

    async fn send(&self, command: HubCommand) -> Result<(), Error> {
        self.commands.send(command).await.map_err(|_| hub_gone())
    }
}

fn hub_gone() -> Error {
    Error::Session("Hub worker is not running".to_string())
}

struct HubWorker {
    members: HashMap<MemberId, mpsc::Sender<String>>,
    next_id: MemberId,
}

impl HubWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>) {
        info!("Hub worker started");

        while let Some(command) = commands.recv().await {
            match command {
                HubCommand::Join { outbound, reply } => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.members.insert(id, outbound);
                    debug!("Member {} joined, {} connected", id, self.members.len());
                    let _ = reply.send(id);
                }
                HubCommand::Leave { id } => {
                    if self.members.remove(&id).is_some() {
                        debug!("Member {} left, {} connected", id, self.members.len());
                    }
                }
                HubCommand::Publish { text } => self.broadcast(&text),
                HubCommand::Count { reply } => {
                    let _ = reply.send(self.members.len());
                }
            }
        }

        info!("Hub worker stopped");
    }

    /// Best-effort fan-out: full or closed member queues are skipped
    fn broadcast(&self, text: &str) {
        for (id, outbound) in &self.members {
            if outbound.try_send(text.to_string()).is_err() {
                debug!("Skipping message for member {}", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HubConfig {
        HubConfig {
            member_buffer: 8,
            command_buffer: 16,
        }
    }

    #[tokio::test]
    async fn publish_reaches_all_members_then_only_remaining() {
        let (hub, _task) = HubHandle::spawn(&config());

        let (alice, mut alice_rx) = hub.join("10.0.0.1").await.unwrap();
        let (bob, mut bob_rx) = hub.join("10.0.0.2").await.unwrap();
        let (_carol, mut carol_rx) = hub.join("10.0.0.3").await.unwrap();

        hub.publish(&alice, "hello").await.unwrap();

        let expected = format!("[{}]: hello", &short_hash("10.0.0.1")[..4]);
        assert_eq!(alice_rx.recv().await.unwrap(), expected);
        assert_eq!(bob_rx.recv().await.unwrap(), expected);
        assert_eq!(carol_rx.recv().await.unwrap(), expected);

        hub.leave(&bob).await;
        hub.publish(&alice, "again").await.unwrap();

        assert!(alice_rx.recv().await.unwrap().ends_with("again"));
        assert!(carol_rx.recv().await.unwrap().ends_with("again"));
        // The worker dropped bob's queue, so it closes without the second message
        assert_eq!(bob_rx.recv().await, None);
        assert_eq!(hub.member_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let (hub, _task) = HubHandle::spawn(&config());
        let (member, _rx) = hub.join("10.0.0.1").await.unwrap();

        hub.leave(&member).await;
        hub.leave(&member).await;
        assert_eq!(hub.member_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn member_tag_is_derived_from_origin() {
        let (hub, _task) = HubHandle::spawn(&config());
        let (a, _a_rx) = hub.join("192.168.1.7").await.unwrap();
        let (b, _b_rx) = hub.join("192.168.1.7").await.unwrap();

        assert_eq!(a.tag, short_hash("192.168.1.7"));
        assert_eq!(a.tag, b.tag);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn slow_member_is_skipped_without_blocking_others() {
        let (hub, _task) = HubHandle::spawn(&HubConfig {
            member_buffer: 1,
            command_buffer: 16,
        });
        let (sender, mut sender_rx) = hub.join("10.0.0.1").await.unwrap();
        let (_slow, mut slow_rx) = hub.join("10.0.0.2").await.unwrap();

        hub.publish(&sender, "one").await.unwrap();
        assert!(sender_rx.recv().await.unwrap().ends_with("one"));
        hub.publish(&sender, "two").await.unwrap();
        assert!(sender_rx.recv().await.unwrap().ends_with("two"));

        // The slow member only had room for the first message
        assert!(slow_rx.recv().await.unwrap().ends_with("one"));
        assert!(slow_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_abort_broadcast() {
        let (hub, _task) = HubHandle::spawn(&config());
        let (sender, mut sender_rx) = hub.join("10.0.0.1").await.unwrap();
        let (_gone, gone_rx) = hub.join("10.0.0.2").await.unwrap();
        drop(gone_rx);

        hub.publish(&sender, "still here").await.unwrap();
        assert!(sender_rx.recv().await.unwrap().ends_with("still here"));
    }
}
