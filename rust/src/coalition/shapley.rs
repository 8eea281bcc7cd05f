//! Shapley value of a transferable-utility coalition game.
//!
//! Each player's share is its marginal contribution to the running
//! coalition, averaged over every order in which the players can join.
//! Enumerating orders is factorial in the player count, which is fine for
//! the handful of traffic classes this crate deals with.

/// A cooperative game with transferable utility.
pub trait CoalitionGame {
    fn players(&self) -> usize;

    /// Worth of the coalition formed by `members` (player indices).
    fn value(&self, members: &[usize]) -> f64;
}

/// Players bring a demand; a coalition is worth its summed demand, but never
/// more than the pool it is drawn from.
#[derive(Clone, Debug)]
pub struct CappedDemandGame<'a> {
    demands: &'a [f64],
    cap: f64,
}

impl<'a> CappedDemandGame<'a> {
    pub fn new(demands: &'a [f64], cap: f64) -> Self {
        Self { demands, cap }
    }
}

impl CoalitionGame for CappedDemandGame<'_> {
    fn players(&self) -> usize {
        self.demands.len()
    }

    fn value(&self, members: &[usize]) -> f64 {
        let total: f64 = members.iter().map(|&i| self.demands[i]).sum();
        total.min(self.cap)
    }
}

/// All orderings of `0..n` (Heap's algorithm, iterative).
pub fn permutations(n: usize) -> Vec<Vec<usize>> {
    let mut current: Vec<usize> = (0..n).collect();
    let mut result = vec![current.clone()];
    let mut counters = vec![0usize; n];
    let mut i = 1;
    while i < n {
        if counters[i] < i {
            if i % 2 == 0 {
                current.swap(0, i);
            } else {
                current.swap(counters[i], i);
            }
            result.push(current.clone());
            counters[i] += 1;
            i = 1;
        } else {
            counters[i] = 0;
            i += 1;
        }
    }
    result
}

/// Shapley value of every player, indexed like the game's players.
pub fn shapley_values<G: CoalitionGame + ?Sized>(game: &G) -> Vec<f64> {
    let n = game.players();
    let mut totals = vec![0.0; n];
    if n == 0 {
        return totals;
    }

    let orders = permutations(n);
    let mut coalition = Vec::with_capacity(n);
    for order in &orders {
        coalition.clear();
        let mut worth = 0.0;
        for &player in order {
            coalition.push(player);
            let joined = game.value(&coalition);
            totals[player] += joined - worth;
            worth = joined;
        }
    }

    let count = orders.len() as f64;
    totals.iter_mut().for_each(|t| *t /= count);
    totals
}
