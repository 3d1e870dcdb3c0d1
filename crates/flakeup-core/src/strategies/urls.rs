//! URL download hashes via the build tool's prefetcher.

use std::collections::BTreeMap;

use flakeup_events::{EventPayload, EventSender, EventStream, gather_event_streams};
use flakeup_nix::prefetch_url;
use flakeup_types::UpdateError;

use crate::context::RunContext;

/// Prefetch each distinct URL and return a URL-to-SRI map.
pub async fn compute_url_hashes(
    source: &str,
    urls: &[String],
    ctx: &RunContext,
    events: &EventSender,
) -> Result<BTreeMap<String, String>, UpdateError> {
    let mut streams = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for url in urls {
        if !seen.insert(url.clone()) {
            continue;
        }
        let source = source.to_string();
        let url = url.clone();
        let config = ctx.config.clone();
        streams.push((
            url.clone(),
            EventStream::spawn(move |tx| async move {
                let sri = prefetch_url(&source, &url, &config, &tx).await?;
                tx.value(&source, EventPayload::Text(sri)).await;
                Ok(())
            }),
        ));
    }

    let gathered = gather_event_streams(streams, events).await?;
    let mut hashes = BTreeMap::new();
    for (url, payload) in gathered {
        hashes.insert(url, payload.into_text()?);
    }
    Ok(hashes)
}
