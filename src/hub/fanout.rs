//! Fan-out of one substep's work across agents.

use std::collections::BTreeMap;
use std::future::Future;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::cluster::SegConfig;
use crate::error::{Error, ErrorList, Result};
use crate::fanout;
use crate::grpc::AgentConn;

/// Runs `f` against every agent concurrently. Each failure is attributed to
/// its host and all of them are reported. Nothing is sent once the phase
/// has been canceled; a cancel arriving mid-flight lets the outstanding
/// calls finish and then fails the fan-out.
pub async fn on_agents<F, Fut>(conns: &[AgentConn], cancel: &CancellationToken, f: F) -> Result<()>
where
    F: Fn(AgentConn) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if cancel.is_cancelled() {
        return Err(Error::Canceled);
    }

    let f = &f;
    let result = fanout::for_each(conns.iter().cloned(), |conn| async move {
        let host = conn.hostname.clone();
        f(conn).await.map_err(|e| Error::agent(host, e))
    })
    .await;

    if result.is_ok() && cancel.is_cancelled() {
        return Err(Error::Canceled);
    }
    result
}

/// Like [`on_agents`] but keeps each host's successful result.
pub async fn collect_from_agents<T, F, Fut>(
    conns: &[AgentConn],
    cancel: &CancellationToken,
    f: F,
) -> Result<Vec<(String, T)>>
where
    F: Fn(AgentConn) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(Error::Canceled);
    }

    let results = join_all(conns.iter().cloned().map(|conn| {
        let host = conn.hostname.clone();
        let work = f(conn);
        async move { (host, work.await) }
    }))
    .await;

    let mut errs = ErrorList::new();
    let mut replies = Vec::with_capacity(results.len());
    for (host, result) in results {
        match result {
            Ok(reply) => replies.push((host, reply)),
            Err(err) => errs.push(Error::agent(host, err)),
        }
    }

    errs.into_result()?;
    if cancel.is_cancelled() {
        return Err(Error::Canceled);
    }
    Ok(replies)
}

/// Segments grouped by the host they live on.
pub fn by_host<'a, I>(segments: I) -> BTreeMap<String, Vec<SegConfig>>
where
    I: IntoIterator<Item = &'a SegConfig>,
{
    let mut hosts: BTreeMap<String, Vec<SegConfig>> = BTreeMap::new();
    for seg in segments {
        hosts.entry(seg.hostname.clone()).or_default().push(seg.clone());
    }
    hosts
}

/// The connections for hosts in `hosts`, in connection order.
pub fn conns_for<V>(conns: &[AgentConn], hosts: &BTreeMap<String, V>) -> Vec<AgentConn> {
    conns
        .iter()
        .filter(|c| hosts.contains_key(&c.hostname))
        .cloned()
        .collect()
}
