///! Maps local UDP peer addresses to tunnel sessions.
///!
///! Two datagrams from a never-before-seen peer can race to open a session
///! concurrently; both run `ClientSession::open` against the server, but only
///! the first to win the table insert is kept; the loser's session is simply
///! dropped (and, eventually, reaped by the server's own idle janitor).

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::tunnel_client::session::ClientSession;

#[derive(Default)]
pub struct NatTable {
    sessions: RwLock<HashMap<SocketAddr, Arc<ClientSession>>>,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session already mapped to `peer`, if any.
    pub async fn get(&self, peer: SocketAddr) -> Option<Arc<ClientSession>> {
        self.sessions.read().await.get(&peer).cloned()
    }

    /// Return the session for `peer`, opening a new one via `opener` if none
    /// exists yet. If another caller wins the race to insert first, this
    /// caller's freshly-opened session is discarded in favor of theirs. The
    /// returned bool is `true` only when the caller's own session won,
    /// signaling that it's this caller's job to spin up its poll loop.
    pub async fn get_or_open<F>(
        &self,
        peer: SocketAddr,
        opener: F,
    ) -> Result<(Arc<ClientSession>, bool)>
    where
        F: Future<Output = Result<Arc<ClientSession>>>,
    {
        if let Some(existing) = self.get(peer).await {
            return Ok((existing, false));
        }

        let candidate = opener.await?;

        let mut table = self.sessions.write().await;
        match table.get(&peer) {
            Some(existing) => Ok((existing.clone(), false)),
            None => {
                table.insert(peer, candidate.clone());
                Ok((candidate, true))
            }
        }
    }

    pub async fn remove(&self, peer: &SocketAddr) {
        self.sessions.write().await.remove(peer);
    }

    /// Snapshot of all `(peer, session)` pairs, used by poll loops and the
    /// idle janitor.
    pub async fn snapshot(&self) -> Vec<(SocketAddr, Arc<ClientSession>)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(addr, session)| (*addr, session.clone()))
            .collect()
    }

    /// Drop every session that has been idle for longer than `idle_after`.
    pub async fn sweep_idle(&self, idle_after: Duration) {
        let mut table = self.sessions.write().await;
        table.retain(|peer, session| {
            let keep = session.idle_for() < idle_after;
            if !keep {
                log::debug!("reaping idle client session for {peer}");
            }
            keep
        });
    }
}
