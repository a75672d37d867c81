//! Choice of the replication server a domain connects to.
//!
//! Candidates are narrowed by successive filters, each applied only when it
//! leaves at least one server: same group, same generation ID, holding every
//! change this replica made. Among the survivors the server furthest below
//! its weighted share of connected domains wins.

use crate::csn::ServerId;
use crate::protocol::ServerInfo;
use crate::server_state::ServerState;

/// The connecting replica, as the filters see it.
#[derive(Debug, Clone, Copy)]
pub struct LocalView<'a> {
    /// Server ID of the replica.
    pub server_id: ServerId,
    /// Group of the replica.
    pub group_id: u8,
    /// Generation ID of the local data.
    pub generation_id: u64,
    /// Everything the replica has applied.
    pub state: &'a ServerState,
}

/// Index into `candidates` of the server to connect to; `None` when empty.
pub fn best_server(candidates: &[ServerInfo], local: &LocalView<'_>) -> Option<usize> {
    let mut best: Vec<usize> = (0..candidates.len()).collect();
    if best.len() <= 1 {
        return best.first().copied();
    }
    keep_if_any(&mut best, |i| candidates[i].group_id == local.group_id);
    if keep_same_generation(candidates, &mut best, local.generation_id) {
        keep_most_up_to_date(candidates, &mut best, local);
    }
    match best.as_slice() {
        [only] => Some(*only),
        _ => Some(by_weight(candidates, &best)),
    }
}

fn keep_if_any(best: &mut Vec<usize>, keep: impl Fn(usize) -> bool) -> bool {
    let kept: Vec<usize> = best.iter().copied().filter(|i| keep(*i)).collect();
    if kept.is_empty() {
        return false;
    }
    *best = kept;
    true
}

/// Servers of the same generation; servers without a generation qualify
/// too while every same-generation server is still empty.
fn keep_same_generation(candidates: &[ServerInfo], best: &mut Vec<usize>, generation_id: u64) -> bool {
    let same_all_empty = best
        .iter()
        .filter(|i| candidates[**i].generation_id == Some(generation_id))
        .all(|i| candidates[*i].server_state.is_empty());
    keep_if_any(best, |i| match candidates[i].generation_id {
        Some(id) => id == generation_id,
        None => same_all_empty,
    })
}

/// Servers holding the newest change of this replica, preferring servers
/// that hold changes the replica itself lost.
fn keep_most_up_to_date(candidates: &[ServerInfo], best: &mut Vec<usize>, local: &LocalView<'_>) {
    let own = |i: usize| candidates[i].server_state.max_csn(local.server_id);
    let Some(newest) = best.iter().map(|i| own(*i)).max() else {
        return;
    };
    if newest >= local.state.max_csn(local.server_id) {
        keep_if_any(best, |i| own(i) == newest);
    }
}

/// Server furthest below its load goal (weight share minus share of
/// connected domains). When every server sits exactly on its goal, the
/// heaviest one.
fn by_weight(candidates: &[ServerInfo], best: &[usize]) -> usize {
    let total_weight: i128 = best.iter().map(|i| i128::from(candidates[*i].weight)).sum();
    let total_connected: i128 = best
        .iter()
        .map(|i| i128::from(candidates[*i].connected_domains))
        .sum();
    // distance * total_weight * total_connected, exact
    let distance = |i: usize| {
        let weight = i128::from(candidates[i].weight);
        if total_connected == 0 {
            weight
        } else {
            weight * total_connected - i128::from(candidates[i].connected_domains) * total_weight
        }
    };

    let mut chosen = best[0];
    let mut heaviest = best[0];
    let mut balanced = true;
    for &i in best {
        if distance(i) > distance(chosen) {
            chosen = i;
        }
        if distance(i) != 0 {
            balanced = false;
        }
        if candidates[i].weight > candidates[heaviest].weight {
            heaviest = i;
        }
    }
    if balanced {
        heaviest
    } else {
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::Csn;

    fn info(sid: u32) -> ServerInfo {
        ServerInfo {
            server_id: ServerId::new(sid),
            group_id: 1,
            weight: 1,
            generation_id: Some(7),
            server_state: ServerState::new(),
            connected_domains: 0,
        }
    }

    fn state(csns: &[(i64, u32)]) -> ServerState {
        let mut state = ServerState::new();
        for (ts, sid) in csns {
            state.update(&Csn::new(*ts, ServerId::new(*sid), 0));
        }
        state
    }

    fn pick(candidates: &[ServerInfo], local_state: &ServerState) -> Option<ServerId> {
        let local = LocalView {
            server_id: ServerId::new(1),
            group_id: 1,
            generation_id: 7,
            state: local_state,
        };
        best_server(candidates, &local).map(|i| candidates[i].server_id)
    }

    #[test]
    fn test_empty_and_single() {
        assert_eq!(pick(&[], &ServerState::new()), None);
        let mut other_group = info(100);
        other_group.group_id = 9;
        assert_eq!(pick(&[other_group], &ServerState::new()), Some(ServerId::new(100)));
    }

    #[test]
    fn test_same_group_preferred() {
        let mut far = info(100);
        far.group_id = 2;
        far.weight = 10;
        assert_eq!(pick(&[far, info(101)], &ServerState::new()), Some(ServerId::new(101)));
    }

    #[test]
    fn test_other_group_when_no_same_group() {
        let mut a = info(100);
        a.group_id = 2;
        let mut b = info(101);
        b.group_id = 3;
        b.weight = 3;
        assert_eq!(pick(&[a, b], &ServerState::new()), Some(ServerId::new(101)));
    }

    #[test]
    fn test_same_generation_preferred() {
        let mut stale = info(100);
        stale.generation_id = Some(3);
        stale.weight = 5;
        assert_eq!(pick(&[stale, info(101)], &ServerState::new()), Some(ServerId::new(101)));
    }

    #[test]
    fn test_server_without_generation_only_while_others_empty() {
        let mut fresh = info(100);
        fresh.generation_id = None;
        fresh.weight = 5;
        assert_eq!(
            pick(&[fresh.clone(), info(101)], &ServerState::new()),
            Some(ServerId::new(100))
        );

        let mut loaded = info(101);
        loaded.server_state = state(&[(5, 2)]);
        assert_eq!(pick(&[fresh, loaded], &ServerState::new()), Some(ServerId::new(101)));
    }

    #[test]
    fn test_server_missing_own_changes_avoided() {
        let local = state(&[(20, 1)]);
        let mut behind = info(100);
        behind.server_state = state(&[(10, 1)]);
        behind.weight = 5;
        let mut current = info(101);
        current.server_state = state(&[(20, 1)]);
        assert_eq!(pick(&[behind, current], &local), Some(ServerId::new(101)));
    }

    #[test]
    fn test_server_ahead_of_local_preferred() {
        let local = state(&[(20, 1)]);
        let mut current = info(100);
        current.server_state = state(&[(20, 1)]);
        current.weight = 5;
        let mut ahead = info(101);
        ahead.server_state = state(&[(30, 1)]);
        assert_eq!(pick(&[current, ahead], &local), Some(ServerId::new(101)));
    }

    #[test]
    fn test_weight_goal_distance() {
        // Goals 1/4 and 3/4; loads 1/2 and 1/2: the heavier server is below goal.
        let mut light = info(100);
        light.connected_domains = 2;
        let mut heavy = info(101);
        heavy.weight = 3;
        heavy.connected_domains = 2;
        assert_eq!(pick(&[light, heavy], &ServerState::new()), Some(ServerId::new(101)));

        // Goals 1/2 and 1/2; loads 3/4 and 1/4.
        let mut busy = info(100);
        busy.connected_domains = 3;
        let mut idle = info(101);
        idle.connected_domains = 1;
        assert_eq!(pick(&[busy, idle], &ServerState::new()), Some(ServerId::new(101)));
    }

    #[test]
    fn test_balanced_servers_pick_heaviest() {
        let mut a = info(100);
        a.connected_domains = 1;
        let mut b = info(101);
        b.weight = 2;
        b.connected_domains = 2;
        assert_eq!(pick(&[a, b], &ServerState::new()), Some(ServerId::new(101)));
    }
}
