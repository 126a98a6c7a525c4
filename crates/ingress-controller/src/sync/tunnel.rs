use crate::aggregate::DesiredState;
use crate::model::TunnelRule;
use crate::tunnel_service::TunnelService;
use crate::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Brings the live tunnel rules in line with `desired`, issuing at most one full replace.
/// Returns whether the remote configuration was rewritten.
pub async fn sync(
    tunnel_service: &dyn TunnelService,
    tunnel_id: Uuid,
    desired: &DesiredState,
    kube_api_rule: Option<&TunnelRule>,
) -> Result<bool, Error> {
    let live = tunnel_service.tunnel_rules(tunnel_id).await?;

    let Some(rules) = plan(&live, desired, kube_api_rule) else {
        debug!(%tunnel_id, rules = live.len(), "tunnel configuration up to date");
        return Ok(false);
    };

    info!(%tunnel_id, rules = rules.len(), "replacing tunnel configuration");
    tunnel_service.replace_tunnel_rules(tunnel_id, &rules).await?;
    Ok(true)
}

/// Removes every live rule routing the same hostname and path as one of `removed`.
pub async fn remove(
    tunnel_service: &dyn TunnelService,
    tunnel_id: Uuid,
    removed: &[TunnelRule],
) -> Result<bool, Error> {
    if removed.is_empty() {
        return Ok(false);
    }

    let live = tunnel_service.tunnel_rules(tunnel_id).await?;
    let Some(rules) = retain_without(&live, removed) else {
        debug!(%tunnel_id, "no tunnel rules to remove");
        return Ok(false);
    };

    info!(%tunnel_id, rules = rules.len(), "removing rules from tunnel configuration");
    tunnel_service.replace_tunnel_rules(tunnel_id, &rules).await?;
    Ok(true)
}

/// The rule list to write, or `None` when `live` already serves exactly the desired rules.
///
/// Each desired entry must appear contiguously and in order somewhere in `live`, starting at the
/// first occurrence of its first rule. Any absent or diverging entry, a stale or missing rule,
/// a misplaced catch-all or a wrong cluster API rule causes a rewrite from scratch.
pub fn plan(
    live: &[TunnelRule],
    desired: &DesiredState,
    kube_api_rule: Option<&TunnelRule>,
) -> Option<Vec<TunnelRule>> {
    let is_kube_api_rule = |rule: &TunnelRule| {
        kube_api_rule.is_some_and(|kube_api_rule| {
            rule.hostname == kube_api_rule.hostname && rule.service == kube_api_rule.service
        })
    };

    let has_kube_api_rule = live.iter().any(is_kube_api_rule);
    let wants_kube_api_rule = kube_api_rule.is_some();

    let changed = entries_diverge(live, desired)
        || has_kube_api_rule != wants_kube_api_rule
        || live
            .iter()
            .filter(|rule| !rule.is_catch_all() && !is_kube_api_rule(*rule))
            .count()
            != desired.rules().count()
        || !catch_all_in_place(live);

    if !changed {
        return None;
    }

    let mut rules = desired.rules().cloned().collect::<Vec<_>>();
    rules.extend(kube_api_rule.cloned());
    if !rules.is_empty() {
        rules.push(TunnelRule::catch_all());
    }
    Some(rules)
}

/// `live` without the routes of `removed`, or `None` when nothing would be removed. A list left
/// with only the catch-all collapses to empty.
pub fn retain_without(live: &[TunnelRule], removed: &[TunnelRule]) -> Option<Vec<TunnelRule>> {
    let routed = live
        .iter()
        .filter(|rule| !rule.is_catch_all())
        .collect::<Vec<_>>();

    let mut rules = routed
        .iter()
        .filter(|rule| !removed.iter().any(|removed| removed.same_route(rule)))
        .map(|rule| (*rule).clone())
        .collect::<Vec<_>>();

    if rules.len() == routed.len() {
        return None;
    }

    if !rules.is_empty() {
        rules.push(TunnelRule::catch_all());
    }
    Some(rules)
}

fn entries_diverge(live: &[TunnelRule], desired: &DesiredState) -> bool {
    desired.entries().any(|rules| {
        let Some(first) = rules.first() else {
            return false;
        };
        match live.iter().position(|rule| rule == first) {
            Some(offset) => live.get(offset..offset + rules.len()) != Some(rules),
            None => true,
        }
    })
}

// An empty list needs no catch-all, otherwise it must be last, unique and follow real rules.
fn catch_all_in_place(live: &[TunnelRule]) -> bool {
    match live.split_last() {
        None => true,
        Some((last, routed)) => {
            last.is_catch_all()
                && !routed.is_empty()
                && !routed.iter().any(TunnelRule::is_catch_all)
        }
    }
}
