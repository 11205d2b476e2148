//! The roster: users allowed on this node.

use std::collections::HashMap;

use crate::model::{mbps_to_bytes_per_sec, Service};

/// One user in the roster.
///
/// Roster snapshots are compared by full value: if any field of a user
/// changes, the old and new values are different entries.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[non_exhaustive]
pub struct ServiceInfo {
    /// The panel's identifier for the user.
    pub uid: u64,
    /// The user's credential (UUID or password).
    pub uuid: String,
    /// The user's email.
    pub email: String,
    /// Simultaneous addresses allowed on this node.  Zero: no limit.
    pub device_limit: u32,
    /// Speed limit in bytes/s.  Zero: none.
    pub speed_limit: u64,
}

impl ServiceInfo {
    /// Construct a new `ServiceInfo`.
    pub fn new(
        uid: u64,
        uuid: impl Into<String>,
        email: impl Into<String>,
        device_limit: u32,
        speed_limit: u64,
    ) -> Self {
        ServiceInfo {
            uid,
            uuid: uuid.into(),
            email: email.into(),
            device_limit,
            speed_limit,
        }
    }
}

/// Clamp a panel count into a device limit.
fn device_count(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

/// Turn the panel's roster into [`ServiceInfo`]s.
///
/// `last_online` maps each uid to the number of addresses we reported for
/// it in our last online report.
///
/// The panel's `iplimit` is a limit across all nodes, and its `ipcount`
/// includes the addresses we ourselves reported.  For a user with both
/// set, the limit we enforce is `iplimit - ipcount + last_online`: the
/// addresses still free, plus the ones already in use here.  If that isn't
/// positive we fall back to `last_online` (keep the connections we have)
/// and if that is zero too, the user is left out of the roster entirely.
///
/// A user whose addresses are all in use elsewhere and who has never been
/// reported by this node is therefore skipped, rather than admitted with a
/// limit of zero (which would mean "unlimited").
pub(crate) fn parse_roster_wire(services: Vec<Service>, last_online: &HashMap<u64, u32>) -> Vec<ServiceInfo> {
    services
        .into_iter()
        .filter_map(|s| {
            let mut device_limit = s.iplimit;
            if s.iplimit > 0 && s.ipcount > 0 {
                let last = i64::from(last_online.get(&s.id).copied().unwrap_or(0));
                let free = s.iplimit.saturating_sub(s.ipcount).saturating_add(last);
                if free > 0 {
                    device_limit = free;
                } else if last > 0 {
                    device_limit = last;
                } else {
                    return None;
                }
            }
            Some(ServiceInfo {
                uid: s.id,
                uuid: s.uuid,
                email: s.email,
                device_limit: device_count(device_limit),
                speed_limit: mbps_to_bytes_per_sec(s.speedlimit),
            })
        })
        .collect()
}

/// Parse the body of a roster request.
///
/// See [`PanelClient`](crate::PanelClient) for where `last_online` comes
/// from.
pub fn parse_roster(body: &[u8], last_online: &HashMap<u64, u32>) -> crate::Result<Vec<ServiceInfo>> {
    let list: crate::model::ServiceList = serde_json::from_slice(body)
        .map_err(|e| crate::Error::invalid_response("roster", e))?;
    Ok(parse_roster_wire(list.services, last_online))
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list @@ -->
    use super::*;
    use serde_json::json;

    fn roster(v: serde_json::Value, last: &[(u64, u32)]) -> Vec<ServiceInfo> {
        let last = last.iter().copied().collect();
        parse_roster(v.to_string().as_bytes(), &last).unwrap()
    }

    fn one(iplimit: i64, ipcount: i64) -> serde_json::Value {
        json!({ "services": [
            { "id": 1, "uuid": "u-1", "email": "a", "iplimit": iplimit, "ipcount": ipcount, "speedlimit": 10 }
        ]})
    }

    #[test]
    fn conversions() {
        let r = roster(one(0, 0), &[]);
        assert_eq!(r, vec![ServiceInfo::new(1, "u-1", "a", 0, 1_250_000)]);
    }

    #[test]
    fn saturated_without_history_is_skipped() {
        assert!(roster(one(2, 2), &[]).is_empty());
    }

    #[test]
    fn free_addresses() {
        // Three allowed, one in use elsewhere.
        assert_eq!(roster(one(3, 1), &[])[0].device_limit, 2);
        // ...and that one was ours.
        assert_eq!(roster(one(3, 1), &[(1, 1)])[0].device_limit, 3);
    }

    #[test]
    fn saturated_by_us() {
        // Two allowed, both ours.
        assert_eq!(roster(one(2, 2), &[(1, 2)])[0].device_limit, 2);
        // Over-counted by the panel: keep what we have.
        assert_eq!(roster(one(2, 5), &[(1, 1)])[0].device_limit, 1);
        // Someone else's history doesn't help.
        assert!(roster(one(2, 2), &[(9, 2)]).is_empty());
    }

    #[test]
    fn no_count_means_plain_limit() {
        assert_eq!(roster(one(4, 0), &[(1, 3)])[0].device_limit, 4);
        assert_eq!(roster(one(-1, 3), &[])[0].device_limit, 0);
    }

    #[test]
    fn huge_counts_saturate() {
        assert_eq!(roster(one(i64::MAX, 1), &[(1, 5)])[0].device_limit, u32::MAX);
        assert!(roster(one(1, i64::MAX), &[]).is_empty());
        assert_eq!(roster(one(1, i64::MAX), &[(1, 2)])[0].device_limit, 2);
    }

    #[test]
    fn malformed() {
        let e = parse_roster(b"{\"services\": 3}", &HashMap::new()).unwrap_err();
        assert!(matches!(e, crate::Error::InvalidResponse { .. }));
    }
}
