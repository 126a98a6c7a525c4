use crate::tunnel_service::{TunnelService, Zone};
use crate::Error;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// A hostname belongs to a zone when it is the zone apex or a subdomain of it. A bare suffix
/// is not enough: `evil-example.com` is not in `example.com`.
pub fn is_in_zone(hostname: &str, zone: &str) -> bool {
    hostname == zone
        || hostname
            .strip_suffix(zone)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// The most specific zone owning `hostname`.
pub fn owning_zone<'a>(hostname: &str, zones: &'a [Zone]) -> Option<&'a Zone> {
    zones
        .iter()
        .filter(|zone| is_in_zone(hostname, &zone.name))
        .max_by_key(|zone| zone.name.len())
}

/// Ensures one proxied CNAME to `target` per hostname and deletes the tunnel's records that no
/// hostname wants anymore. Every zone owning one of `hostnames` or one of `released` is swept,
/// so a hostname that moved to another zone leaves no record behind.
pub async fn sync(
    tunnel_service: &dyn TunnelService,
    zones: &[Zone],
    target: &str,
    hostnames: &BTreeSet<String>,
    released: &BTreeSet<String>,
) -> Result<(), Error> {
    let mut grouped = group_by_zone(zones, hostnames);
    for hostname in released {
        if let Some(zone) = owning_zone(hostname, zones) {
            grouped
                .entry(zone.id.as_str())
                .or_insert_with(|| (zone, BTreeSet::new()));
        }
    }

    for (zone, wanted) in grouped.into_values() {
        let records = tunnel_service.cname_records(&zone.id, target).await?;

        for hostname in &wanted {
            if records.iter().any(|record| record.name == *hostname) {
                continue;
            }
            match tunnel_service
                .create_cname_record(&zone.id, hostname, target)
                .await
            {
                Ok(()) => info!(%hostname, zone = %zone.name, "created dns record"),
                Err(Error::RecordAlreadyExists(_)) => {
                    debug!(%hostname, zone = %zone.name, "dns record already exists")
                }
                Err(err) => return Err(err),
            }
        }

        for record in records
            .iter()
            .filter(|record| !wanted.contains(record.name.as_str()))
        {
            match tunnel_service.delete_dns_record(&zone.id, &record.id).await {
                Ok(()) => {
                    info!(hostname = %record.name, zone = %zone.name, "deleted orphaned dns record")
                }
                Err(err) => return Err(err),
            }
        }
    }

    Ok(())
}

/// Deletes the tunnel's records named after one of `hostnames`.
pub async fn delete(
    tunnel_service: &dyn TunnelService,
    zones: &[Zone],
    target: &str,
    hostnames: &BTreeSet<String>,
) -> Result<(), Error> {
    for (zone, removed) in group_by_zone(zones, hostnames).into_values() {
        let records = tunnel_service.cname_records(&zone.id, target).await?;

        for record in records
            .iter()
            .filter(|record| removed.contains(record.name.as_str()))
        {
            match tunnel_service.delete_dns_record(&zone.id, &record.id).await {
                Ok(()) => info!(hostname = %record.name, zone = %zone.name, "deleted dns record"),
                Err(err) => return Err(err),
            }
        }
    }

    Ok(())
}

fn group_by_zone<'a>(
    zones: &'a [Zone],
    hostnames: &'a BTreeSet<String>,
) -> BTreeMap<&'a str, (&'a Zone, BTreeSet<&'a str>)> {
    let mut grouped: BTreeMap<&str, (&Zone, BTreeSet<&str>)> = BTreeMap::new();
    for hostname in hostnames {
        match owning_zone(hostname, zones) {
            Some(zone) => {
                grouped
                    .entry(zone.id.as_str())
                    .or_insert_with(|| (zone, BTreeSet::new()))
                    .1
                    .insert(hostname.as_str());
            }
            None => warn!(%hostname, "no zone found for hostname, skipping dns record"),
        }
    }
    grouped
}
