//! Splitting and scheduling strategies for the disbursement transactions.
//! The splitting decides how a user's denomination is divided into
//! sub-payments; the schedule spreads them over the mixing window. Both are
//! driven by a PRNG seeded from the shuffle checksum so every peer derives
//! the same plan.

use std::time::Duration;

use bitcoin::Amount;
use rand::Rng;

/// One milli-unit is 0.001 BTC.
pub const MILLI_UNIT: Amount = Amount::from_sat(100_000);

/// Allowed sub-payment sizes in milli-units, sorted decreasingly, and the
/// probability of picking each.
pub const SPLIT_VALUES: [u64; 5] = [1000, 200, 100, 10, 1];
pub const SPLIT_WEIGHTS: [f64; 5] = [0.13, 0.19, 0.11, 0.45, 0.12];

/// The whole value in one transaction. Requires the value to be one of the
/// allowed denominations.
pub fn split_single_transaction(value: Amount) -> Result<Vec<Amount>, String> {
	let sats = value.to_sat();
	if sats % MILLI_UNIT.to_sat() != 0 {
		return Err("value_not_allowed".to_string())
	}
	let milli = sats / MILLI_UNIT.to_sat();
	if !SPLIT_VALUES.contains(&milli) {
		return Err("value_not_allowed".to_string())
	}
	Ok(vec![value])
}

/// Divide the value into denomination-sized sub-payments, drawing each
/// denomination with its configured weight (renormalized as large
/// denominations stop fitting), then shuffle the resulting sequence.
pub fn split_divide_and_fill(
	value: Amount,
	rng: &mut impl Rng,
) -> Result<Vec<Amount>, String> {
	let sats = value.to_sat();
	let smallest = SPLIT_VALUES[SPLIT_VALUES.len() - 1] * MILLI_UNIT.to_sat();
	if sats % smallest != 0 {
		return Err("value_not_splittable".to_string())
	}

	let mut remaining = sats / MILLI_UNIT.to_sat();
	let mut values: Vec<u64> = SPLIT_VALUES.to_vec();
	let mut weights: Vec<f64> = SPLIT_WEIGHTS.to_vec();
	let mut split = Vec::new();

	while remaining > 0 {
		while !values.is_empty() && remaining < values[0] {
			let dropped = weights.remove(0);
			values.remove(0);
			for weight in weights.iter_mut() {
				*weight /= 1.0 - dropped;
			}
		}
		let r: f64 = rng.gen();
		let mut cumulative = weights[0];
		let mut pick = 0;
		while r > cumulative && pick + 1 < weights.len() {
			pick += 1;
			cumulative += weights[pick];
		}
		split.push(values[pick]);
		remaining -= values[pick];
	}

	// Hide the draw order
	for i in (1..split.len()).rev() {
		let j = rng.gen_range(0..=i);
		split.swap(i, j);
	}

	Ok(split
		.into_iter()
		.map(|milli| Amount::from_sat(milli * MILLI_UNIT.to_sat()))
		.collect())
}

/// Evenly spaced sub-payments across the window.
pub fn schedule_fixed(count: usize, mixing_window_mins: u64) -> Vec<Duration> {
	let interval = (mixing_window_mins as f64 * 60.0) / count as f64;
	(0..count)
		.map(|i| Duration::from_secs_f64(i as f64 * interval))
		.collect()
}

/// Uniformly random launch times within the window, sorted ascending.
pub fn schedule_random(
	count: usize,
	mixing_window_mins: u64,
	rng: &mut impl Rng,
) -> Vec<Duration> {
	let window_secs = mixing_window_mins as f64 * 60.0;
	let mut schedule: Vec<f64> = (0..count).map(|_| rng.gen::<f64>() * window_secs).collect();
	schedule.sort_by(|a, b| a.partial_cmp(b).expect("schedule times are finite"));
	schedule.into_iter().map(Duration::from_secs_f64).collect()
}

/// Merge the per-escrow schedules into one global launch order: pairs of
/// (position within `schedules`, launch offset), sorted by time.
pub fn serialize_schedules(schedules: &[Vec<Duration>]) -> Vec<(usize, Duration)> {
	let mut serialized: Vec<(usize, Duration)> = schedules
		.iter()
		.enumerate()
		.flat_map(|(escrow, schedule)| {
			schedule.iter().map(move |offset| (escrow, *offset))
		})
		.collect();
	serialized.sort_by_key(|(_, offset)| *offset);
	serialized
}
