use std::cmp::Reverse;
use std::collections::BTreeSet;

use log::debug;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;

use crate::config::Config;
use crate::core::TransferRate;
use crate::engine::ConnId;

/// Connections whose choke state must change.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChokeDecision {
    pub peers_to_choke: BTreeSet<ConnId>,
    pub peers_to_unchoke: BTreeSet<ConnId>,
}

/// Tit-for-tat choking: the fastest interested peers are unchoked, plus one interested peer
/// picked at random that keeps its slot until the next rotation.
#[derive(Debug)]
pub struct Choker {
    slots: usize,
    optimistic: Option<ConnId>,
    rng: StdRng,
}

impl Choker {
    pub fn new(config: &Config) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            slots: config.unchoke_slots,
            optimistic: None,
            rng,
        }
    }

    /// Current holder of the optimistic slot.
    pub fn optimistic(&self) -> Option<ConnId> {
        self.optimistic
    }

    /// Ranks `interested` peers by the rate that matters (upload to them when seeding, download
    /// from them otherwise) and decides who is unchoked. `unchoked` are the peers currently
    /// unchoked. With `rotate` the optimistic slot is drawn again, excluding its previous
    /// holder when anyone else is eligible.
    pub fn rechoke(
        &mut self,
        interested: &[(ConnId, TransferRate)],
        unchoked: &BTreeSet<ConnId>,
        rotate: bool,
    ) -> ChokeDecision {
        let mut ranked = interested.to_vec();
        ranked.sort_by_key(|(conn, rate)| (Reverse(*rate), *conn));

        let mut selected: BTreeSet<ConnId> = ranked
            .iter()
            .take(self.slots)
            .map(|(conn, _)| *conn)
            .collect();
        let remaining = ranked
            .iter()
            .map(|(conn, _)| *conn)
            .filter(|conn| !selected.contains(conn));

        let previous = self.optimistic;
        let keep =
            !rotate && previous.is_some_and(|conn| remaining.clone().any(|c| c == conn));
        if !keep {
            let others = remaining.clone().filter(|conn| Some(*conn) != previous);
            self.optimistic = others
                .choose(&mut self.rng)
                .or_else(|| remaining.clone().find(|conn| Some(*conn) == previous));
            if self.optimistic != previous {
                debug!(
                    "optimistic unchoke moved from {:?} to {:?}",
                    previous, self.optimistic
                );
            }
        }
        if let Some(conn) = self.optimistic {
            selected.insert(conn);
        }

        ChokeDecision {
            peers_to_choke: unchoked.difference(&selected).copied().collect(),
            peers_to_unchoke: selected.difference(unchoked).copied().collect(),
        }
    }

    pub fn peer_disconnected(&mut self, conn: ConnId) {
        if self.optimistic == Some(conn) {
            self.optimistic = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use size::Size;

    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    fn choker(seed: u64) -> Choker {
        Choker::new(&Config::default().with_rng_seed(seed))
    }

    fn rate(kib: i64) -> TransferRate {
        TransferRate(Size::from_kibibytes(kib), SEC)
    }

    fn peers(rates: &[i64]) -> Vec<(ConnId, TransferRate)> {
        rates
            .iter()
            .enumerate()
            .map(|(i, kib)| (ConnId(i as u64 + 1), rate(*kib)))
            .collect()
    }

    fn ids(ids: &[u64]) -> BTreeSet<ConnId> {
        ids.iter().map(|id| ConnId(*id)).collect()
    }

    #[test]
    fn less_than_4_interested_peers() {
        let mut choker = choker(1);
        let interested = peers(&[10, 10]);

        let decision = choker.rechoke(&interested, &BTreeSet::new(), false);

        assert_eq!(decision.peers_to_unchoke, ids(&[1, 2]));
        assert!(decision.peers_to_choke.is_empty());
        assert_eq!(choker.optimistic(), None);
    }

    #[test]
    fn top_4_plus_1_optimistic() {
        let mut choker = choker(7);
        // Peers 1 and 2 are the slowest
        let interested = peers(&[10, 20, 30, 40, 50, 60]);

        let decision = choker.rechoke(&interested, &BTreeSet::new(), false);

        let optimistic = choker.optimistic().unwrap();
        assert!(optimistic == ConnId(1) || optimistic == ConnId(2));
        let mut expected = ids(&[3, 4, 5, 6]);
        expected.insert(optimistic);
        assert_eq!(decision.peers_to_unchoke, expected);
    }

    #[test]
    fn rechoke_previously_unchoked_peers_if_not_selected() {
        let mut choker = choker(3);
        let interested = peers(&[10, 20, 30, 40, 50]);
        // Peer 9 is no longer interested
        let unchoked = ids(&[1, 3, 9]);

        let decision = choker.rechoke(&interested, &unchoked, false);

        // Peer 1 is the only candidate for the optimistic slot
        assert_eq!(choker.optimistic(), Some(ConnId(1)));
        assert_eq!(decision.peers_to_choke, ids(&[9]));
        assert_eq!(decision.peers_to_unchoke, ids(&[2, 4, 5]));
    }

    #[test]
    fn optimistic_slot_survives_rerank() {
        let mut choker = choker(11);
        let interested = peers(&[10, 20, 30, 40, 50, 60]);
        choker.rechoke(&interested, &BTreeSet::new(), false);
        let optimistic = choker.optimistic();

        for _ in 0..10 {
            choker.rechoke(&interested, &BTreeSet::new(), false);
            assert_eq!(choker.optimistic(), optimistic);
        }
    }

    #[test]
    fn rotation_moves_optimistic_slot() {
        for seed in 0..20 {
            let mut choker = choker(seed);
            let interested = peers(&[10, 20, 30, 40, 50, 60]);
            let first = choker.rechoke(&interested, &BTreeSet::new(), false);
            let before = choker.optimistic().unwrap();
            let unchoked: BTreeSet<_> = first.peers_to_unchoke;

            let rotated = choker.rechoke(&interested, &unchoked, true);
            let after = choker.optimistic().unwrap();

            assert_ne!(before, after);
            assert_eq!(rotated.peers_to_choke, BTreeSet::from([before]));
            assert_eq!(rotated.peers_to_unchoke, BTreeSet::from([after]));
        }
    }

    #[test]
    fn optimistic_peer_promoted_by_rank() {
        let mut choker = choker(5);
        choker.rechoke(&peers(&[10, 20, 30, 40, 50]), &BTreeSet::new(), false);
        assert_eq!(choker.optimistic(), Some(ConnId(1)));

        // Peer 1 became the fastest, peer 2 is now the only one left out
        let unchoked = ids(&[1, 2, 3, 4, 5]);
        let decision = choker.rechoke(&peers(&[90, 20, 30, 40, 50]), &unchoked, false);

        assert_eq!(choker.optimistic(), Some(ConnId(2)));
        assert!(decision.peers_to_choke.is_empty());
    }

    #[test]
    fn disconnected_peer_loses_optimistic_slot() {
        let mut choker = choker(5);
        choker.rechoke(&peers(&[10, 20, 30, 40, 50]), &BTreeSet::new(), false);

        choker.peer_disconnected(ConnId(1));

        assert_eq!(choker.optimistic(), None);
    }

    #[test]
    fn seeded_draws_are_reproducible() {
        let interested = peers(&[1, 1, 1, 1, 1, 1, 1, 1, 1, 1]);
        let mut a = choker(42);
        let mut b = choker(42);

        for _ in 0..5 {
            a.rechoke(&interested, &BTreeSet::new(), true);
            b.rechoke(&interested, &BTreeSet::new(), true);
            assert_eq!(a.optimistic(), b.optimistic());
        }
    }
}
