//! Width-agnostic vector helpers over the head dimension.
//!
//! Work is split into fixed `LANES`-wide tiles that the compiler can map onto
//! SIMD registers, followed by a scalar tail. Changing `LANES` only changes
//! summation order.

use pagoda_core::{Accumulator, Element};

pub const LANES: usize = 8;

/// Pairwise horizontal sum of one lane tile.
#[inline(always)]
pub fn hsum<A: Accumulator>(acc: [A; LANES]) -> A {
    let mut width = LANES;
    let mut acc = acc;
    while width > 1 {
        width /= 2;
        for l in 0..width {
            acc[l] = acc[l] + acc[l + width];
        }
    }
    acc[0]
}

/// `sum_d q[d] * k[d]`, accumulated in `A`.
#[inline]
pub fn dot<S, A>(q: &[S], k: &[S]) -> A
where
    S: Element,
    A: Accumulator + From<S>,
{
    let mut acc = [A::ZERO; LANES];
    let q_tiles = q.chunks_exact(LANES);
    let k_tiles = k.chunks_exact(LANES);
    let (q_tail, k_tail) = (q_tiles.remainder(), k_tiles.remainder());
    for (qt, kt) in q_tiles.zip(k_tiles) {
        for l in 0..LANES {
            acc[l] += A::from(qt[l]) * A::from(kt[l]);
        }
    }
    let mut sum = hsum(acc);
    for (&qv, &kv) in q_tail.iter().zip(k_tail) {
        sum += A::from(qv) * A::from(kv);
    }
    sum
}

/// Dot products of one query row against two key rows, reading each query
/// element once for both keys.
#[inline]
pub fn dot2<S, A>(q: &[S], k0: &[S], k1: &[S]) -> (A, A)
where
    S: Element,
    A: Accumulator + From<S>,
{
    let mut acc0 = [A::ZERO; LANES];
    let mut acc1 = [A::ZERO; LANES];
    let q_tiles = q.chunks_exact(LANES);
    let k0_tiles = k0.chunks_exact(LANES);
    let k1_tiles = k1.chunks_exact(LANES);
    let (q_tail, k0_tail, k1_tail) = (q_tiles.remainder(), k0_tiles.remainder(), k1_tiles.remainder());
    for ((qt, k0t), k1t) in q_tiles.zip(k0_tiles).zip(k1_tiles) {
        for l in 0..LANES {
            let qv = A::from(qt[l]);
            acc0[l] += qv * A::from(k0t[l]);
            acc1[l] += qv * A::from(k1t[l]);
        }
    }
    let (mut s0, mut s1) = (hsum(acc0), hsum(acc1));
    for ((&qv, &a), &b) in q_tail.iter().zip(k0_tail).zip(k1_tail) {
        let qv = A::from(qv);
        s0 += qv * A::from(a);
        s1 += qv * A::from(b);
    }
    (s0, s1)
}

/// `acc[d] += p * v[d]`.
#[inline]
pub fn axpy<S, A>(acc: &mut [A], p: A, v: &[S])
where
    S: Element,
    A: Accumulator + From<S>,
{
    let mut acc_tiles = acc.chunks_exact_mut(LANES);
    let mut v_tiles = v.chunks_exact(LANES);
    for (at, vt) in (&mut acc_tiles).zip(&mut v_tiles) {
        for l in 0..LANES {
            at[l] += p * A::from(vt[l]);
        }
    }
    for (a, &x) in acc_tiles.into_remainder().iter_mut().zip(v_tiles.remainder()) {
        *a += p * A::from(x);
    }
}
