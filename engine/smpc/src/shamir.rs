//! Shamir secret sharing over a prime field, with Berlekamp-Welch robust
//! recombination for tolerating corrupted or missing shares.

use std::{
	collections::HashMap,
	sync::Mutex,
};

use lazy_static::lazy_static;
use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::{error::SmpcError, field::PrimeField};

/// A share is the evaluation of the sharing polynomial at `x = player`,
/// with player indices starting at 1.
pub type Share = (u32, BigUint);

lazy_static! {
	/// Lagrange coefficients depend only on (modulus, participating players,
	/// evaluation point), so they are computed once per such tuple.
	static ref RECOMBINATION_VECTORS: Mutex<HashMap<(Vec<u8>, Vec<u32>, u32), Vec<BigUint>>> =
		Mutex::new(HashMap::new());
}

/// Split `secret` into `n` shares of a random degree-`t` polynomial with
/// constant term `secret`. Any `t + 1` correct shares recombine to the
/// secret. Also returns the polynomial coefficients `[a_0 .. a_t]`
/// (with `a_0 = secret`) for commitment schemes.
pub fn share(
	secret: &BigUint,
	n: u32,
	t: u32,
	field: &PrimeField,
) -> (Vec<Share>, Vec<BigUint>) {
	assert!(secret < field.modulus(), "secret must be a field element");

	let mut coefficients = vec![secret.clone()];
	coefficients.extend((0..t).map(|_| field.random()));

	let shares = (1..=n)
		.map(|x| (x, evaluate_polynomial(&coefficients, x, field)))
		.collect();

	(shares, coefficients)
}

/// Horner evaluation of `f(x) = a_0 + a_1 x + ... + a_t x^t`.
pub fn evaluate_polynomial(coefficients: &[BigUint], x: u32, field: &PrimeField) -> BigUint {
	let x = BigUint::from(x);
	coefficients
		.iter()
		.rev()
		.fold(BigUint::zero(), |acc, c| field.add(&field.mul(&acc, &x), c))
}

/// Recombine shares at `x`. Missing shares are passed as `None`.
///
/// With `robust = true` the Berlekamp-Welch decoder is used, tolerating up to
/// `t` corrupted (or missing, substituted with zero) shares given enough total
/// shares; only `x = 0` is supported there. Without robustness, the first
/// `t + 1` present shares are interpolated directly with cached Lagrange
/// coefficients.
pub fn recombine(
	shares: &[(u32, Option<BigUint>)],
	t: u32,
	x: u32,
	field: &PrimeField,
	robust: bool,
) -> Result<BigUint, SmpcError> {
	if robust {
		assert_eq!(x, 0, "robust recombination only interpolates the secret");
		let mut replaced: Vec<Share> = shares
			.iter()
			.map(|(player, s)| (*player, s.clone().unwrap_or_else(BigUint::zero)))
			.collect();
		replaced.sort_by_key(|(player, _)| *player);
		return berlekamp_welch(&replaced, t, field)
	}

	let filtered: Vec<Share> = shares
		.iter()
		.filter_map(|(player, s)| s.clone().map(|s| (*player, s)))
		.take(t as usize + 1)
		.collect();
	if filtered.len() != t as usize + 1 {
		return Err(SmpcError::NotEnoughShares { got: filtered.len(), needed: t as usize + 1 })
	}

	let players: Vec<u32> = filtered.iter().map(|(player, _)| *player).collect();
	let lagranges = recombination_vector(&players, x, field)?;

	Ok(filtered
		.iter()
		.zip(&lagranges)
		.fold(BigUint::zero(), |acc, ((_, s), l)| field.add(&acc, &field.mul(s, l))))
}

fn recombination_vector(
	players: &[u32],
	x: u32,
	field: &PrimeField,
) -> Result<Vec<BigUint>, SmpcError> {
	let key = (field.modulus().to_bytes_be(), players.to_vec(), x);

	if let Some(cached) = RECOMBINATION_VECTORS
		.lock()
		.expect("recombination cache lock cannot be poisoned")
		.get(&key)
	{
		return Ok(cached.clone())
	}

	let x = BigUint::from(x);
	let lagranges = players
		.iter()
		.map(|i| {
			let i_el = BigUint::from(*i);
			players
				.iter()
				.filter(|k| *k != i)
				.try_fold(BigUint::one(), |acc, k| {
					let k_el = BigUint::from(*k);
					let num = field.sub(&k_el, &x);
					let den = field.invert(&field.sub(&k_el, &i_el))?;
					Ok(field.mul(&acc, &field.mul(&num, &den)))
				})
		})
		.collect::<Result<Vec<_>, SmpcError>>()?;

	RECOMBINATION_VECTORS
		.lock()
		.expect("recombination cache lock cannot be poisoned")
		.insert(key, lagranges.clone());

	Ok(lagranges)
}

/// Berlekamp-Welch decoding: find polynomials Q (degree <= n - th - 1) and
/// E (degree th, monic) with `Q(x_i) = s_i * E(x_i)` for all shares, then
/// the secret is `(Q / E)(0)`. The error tolerance `th` starts at `t` and is
/// decremented whenever the linear system is singular.
fn berlekamp_welch(
	shares: &[Share],
	t: u32,
	field: &PrimeField,
) -> Result<BigUint, SmpcError> {
	let mut th = t as i64;

	let solution = loop {
		if th < 0 {
			return Err(SmpcError::RobustRecombinationFailed)
		}
		let (matrix, rhs) = construct_equation_system(shares, th as u32, field);
		match solve_equation_system(matrix, rhs, field)? {
			Some(solution) => break (solution, th as usize),
			None => th -= 1,
		}
	};

	let (coefficients, th) = solution;
	let n = shares.len();

	// Split the solution vector into Q and E (E is made monic by
	// appending 1)
	let q: Vec<BigUint> = coefficients[..n - th].to_vec();
	let mut e: Vec<BigUint> = coefficients[n - th..].to_vec();
	e.push(BigUint::one());

	let (p, remainder) = divide_polynomials(&q, &e, field)?;
	if !remainder.is_empty() {
		return Err(SmpcError::RobustRecombinationFailed)
	}

	Ok(p.first().cloned().unwrap_or_else(BigUint::zero))
}

/// Rows are `[x^0 .. x^{n-th-1} | -s_i x^0 .. -s_i x^{th-1}]`, right-hand
/// side `s_i * x^th`, with `x = player index`.
fn construct_equation_system(
	shares: &[Share],
	th: u32,
	field: &PrimeField,
) -> (Vec<Vec<BigUint>>, Vec<BigUint>) {
	let n = shares.len();
	let matrix = shares
		.iter()
		.map(|(player, s)| {
			let mut row: Vec<BigUint> =
				(0..n as u32 - th).map(|j| field.pow(&BigUint::from(*player), j)).collect();
			row.extend((0..th).map(|j| {
				field.neg(&field.mul(s, &field.pow(&BigUint::from(*player), j)))
			}));
			row
		})
		.collect();
	let rhs = shares
		.iter()
		.map(|(player, s)| field.mul(s, &field.pow(&BigUint::from(*player), th)))
		.collect();
	(matrix, rhs)
}

/// Gaussian elimination with partial pivoting in the field. Returns `None`
/// when the system is singular.
fn solve_equation_system(
	matrix: Vec<Vec<BigUint>>,
	rhs: Vec<BigUint>,
	field: &PrimeField,
) -> Result<Option<Vec<BigUint>>, SmpcError> {
	let n = matrix.len();
	let mut ab: Vec<Vec<BigUint>> = matrix
		.into_iter()
		.zip(rhs)
		.map(|(row, b)| {
			let mut row = row;
			row.push(b);
			row
		})
		.collect();

	for i in 0..n {
		let pivot = (i..n).filter(|k| !ab[*k][i].is_zero()).max_by_key(|k| ab[*k][i].clone());
		let Some(pivot) = pivot else { return Ok(None) };
		ab.swap(i, pivot);

		let inv = field.invert(&ab[i][i])?;
		for j in 0..=n {
			ab[i][j] = field.mul(&ab[i][j], &inv);
		}
		for k in i + 1..n {
			let factor = ab[k][i].clone();
			for j in 0..=n {
				let sub = field.mul(&factor, &ab[i][j]);
				ab[k][j] = field.sub(&ab[k][j], &sub);
			}
		}
	}

	for i in (0..n).rev() {
		for k in 0..i {
			let factor = ab[k][i].clone();
			for j in 0..=n {
				let sub = field.mul(&factor, &ab[i][j]);
				ab[k][j] = field.sub(&ab[k][j], &sub);
			}
		}
	}

	Ok(Some(ab.into_iter().map(|row| row[n].clone()).collect()))
}

/// Long division of polynomials given in ascending-coefficient order.
/// Returns (quotient, remainder) with zero leading coefficients stripped
/// from the remainder.
fn divide_polynomials(
	q: &[BigUint],
	e: &[BigUint],
	field: &PrimeField,
) -> Result<(Vec<BigUint>, Vec<BigUint>), SmpcError> {
	// Work on descending-order copies
	let mut num: Vec<BigUint> = q.iter().rev().cloned().collect();
	let den: Vec<BigUint> = e.iter().rev().cloned().collect();

	while num.len() > 1 && num[0].is_zero() {
		num.remove(0);
	}

	let mut quotient_desc = Vec::new();
	while num.len() >= den.len() {
		let c = field.div(&num[0], &den[0])?;
		for i in 0..den.len() {
			let sub = field.mul(&c, &den[i]);
			num[i] = field.sub(&num[i], &sub);
		}
		if !num[0].is_zero() {
			return Err(SmpcError::RobustRecombinationFailed)
		}
		num.remove(0);
		quotient_desc.push(c);
	}

	let mut remainder: Vec<BigUint> = num.into_iter().rev().collect();
	while remainder.last().map(|c| c.is_zero()).unwrap_or(false) {
		remainder.pop();
	}

	let quotient: Vec<BigUint> = quotient_desc.into_iter().rev().collect();
	Ok((quotient, remainder))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::field::{HASH_SHARING_PRIME, SECP256K1_ORDER};

	fn some_shares(shares: Vec<Share>) -> Vec<(u32, Option<BigUint>)> {
		shares.into_iter().map(|(player, s)| (player, Some(s))).collect()
	}

	#[test]
	fn split_and_recombine() {
		let field = &*SECP256K1_ORDER;
		for (n, t) in [(3u32, 1u32), (5, 2), (7, 3)] {
			let secret = field.random();
			let (shares, _) = share(&secret, n, t, field);

			// Fast path with exactly t + 1 shares
			let subset = some_shares(shares[..t as usize + 1].to_vec());
			assert_eq!(recombine(&subset, t, 0, field, false).unwrap(), secret);

			// Robust path with all shares
			assert_eq!(recombine(&some_shares(shares), t, 0, field, true).unwrap(), secret);
		}
	}

	#[test]
	fn recombine_over_hash_prime() {
		let field = &*HASH_SHARING_PRIME;
		let secret = field.random();
		let (shares, _) = share(&secret, 3, 1, field);
		assert_eq!(recombine(&some_shares(shares), 1, 0, field, true).unwrap(), secret);
	}

	#[test]
	fn robust_recombination_corrects_corrupted_shares() {
		let field = &*SECP256K1_ORDER;
		let secret = field.random();
		let (mut shares, _) = share(&secret, 7, 2, field);

		// Corrupt t shares
		shares[1].1 = field.random();
		shares[4].1 = field.random();

		assert_eq!(recombine(&some_shares(shares), 2, 0, field, true).unwrap(), secret);
	}

	#[test]
	fn robust_recombination_tolerates_missing_shares() {
		let field = &*SECP256K1_ORDER;
		let secret = field.random();
		let (shares, _) = share(&secret, 5, 1, field);

		let mut with_gap: Vec<(u32, Option<BigUint>)> = some_shares(shares);
		with_gap[2].1 = None;

		assert_eq!(recombine(&with_gap, 1, 0, field, true).unwrap(), secret);
	}

	#[test]
	fn too_many_corruptions_fail() {
		let field = &*SECP256K1_ORDER;
		let secret = field.random();
		let (mut shares, _) = share(&secret, 4, 1, field);

		// 2 corruptions with t = 1 cannot be corrected; the decoder must
		// not silently return a wrong secret
		shares[0].1 = field.random();
		shares[2].1 = field.random();

		match recombine(&some_shares(shares), 1, 0, field, true) {
			Ok(result) => assert_ne!(result, secret),
			Err(_) => {},
		}
	}

	#[test]
	fn interpolation_at_nonzero_point() {
		let field = &*SECP256K1_ORDER;
		let secret = field.random();
		let (shares, coefficients) = share(&secret, 5, 2, field);

		let expected = evaluate_polynomial(&coefficients, 4, field);
		let subset = some_shares(shares[..3].to_vec());
		assert_eq!(recombine(&subset, 2, 4, field, false).unwrap(), expected);
	}

	#[test]
	fn not_enough_shares_is_an_error() {
		let field = &*SECP256K1_ORDER;
		let secret = field.random();
		let (shares, _) = share(&secret, 3, 2, field);
		let subset = some_shares(shares[..2].to_vec());
		assert!(matches!(
			recombine(&subset, 2, 0, field, false),
			Err(SmpcError::NotEnoughShares { .. })
		));
	}

	#[test]
	fn coefficients_match_committed_polynomial() {
		let field = &*SECP256K1_ORDER;
		let secret = field.random();
		let (shares, coefficients) = share(&secret, 4, 2, field);
		assert_eq!(coefficients[0], secret);
		for (player, s) in shares {
			assert_eq!(evaluate_polynomial(&coefficients, player, field), s);
		}
	}
}
