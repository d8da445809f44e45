//! Resync pacing controller.
//!
//! A proportional controller with plan-ahead: each tick it measures the
//! reply arrival rate, computes how many sectors it wants in flight, and
//! spreads the correction over the fifo's planning horizon. With the
//! planner disabled (empty fifo) the fixed resync rate applies. All
//! arithmetic is integer, expressed against the tick base.

use std::sync::atomic::Ordering;

use crate::bitmap::{BM_BLOCK_SHIFT, BM_BLOCK_SIZE};
use crate::device::Device;

/// Ticks per second of the rate arithmetic.
pub const HZ: u64 = 1000;
/// Resync tick length in `HZ` units (100 ms).
pub const SLEEP_TIME: u64 = HZ / 10;

/// One controller invocation: returns the sector budget for this tick.
pub fn rs_controller(device: &Device) -> u64 {
    let config = device.sync_config.lock().clone();
    // Replies that arrived since the last tick.
    let sect_in = device.rs_sect_in.swap(0, Ordering::AcqRel) as i64;

    let mut rate = device.rate();
    rate.rs_in_flight -= sect_in;

    // Number of ticks to plan ahead.
    let steps = rate.fifo.size() as i64;

    let want: i64 = if rate.rs_in_flight + sect_in == 0 {
        // Start of resync: seed from the configured rate.
        ((config.resync_rate as i64 * 2 * SLEEP_TIME as i64) / HZ as i64) * steps
    } else if config.c_fill_target != 0 {
        config.c_fill_target as i64
    } else {
        sect_in * config.c_delay_target as i64 * HZ as i64 / (SLEEP_TIME as i64 * 10)
    };

    let correction = want - rate.rs_in_flight - rate.rs_planed;

    // Plan ahead.
    let cps = correction / steps;
    rate.fifo.add_all(cps);
    rate.rs_planed += cps * steps;

    // What this tick contributes.
    let curr_corr = rate.fifo.push(0);
    rate.rs_planed -= curr_corr;
    drop(rate);

    let req_sect = (sect_in + curr_corr).max(0);
    let max_sect = (config.c_max_rate * 2 * SLEEP_TIME / HZ) as i64;
    req_sect.min(max_sect) as u64
}

/// Per-tick request budget in bitmap-block units.
pub fn rs_number_requests(device: &Device) -> u64 {
    let planner_active = device.rate().fifo.size() > 0;
    if planner_active {
        let number = rs_controller(device) >> (BM_BLOCK_SHIFT - 9);
        device.c_sync_rate.store(
            number * HZ * u64::from(BM_BLOCK_SIZE / 1024) / SLEEP_TIME,
            Ordering::Relaxed,
        );
        // The amount of pending requests is deliberately ignored here;
        // the controller throttles down to the reply rate soon enough.
        number
    } else {
        let rate = device.sync_config.lock().resync_rate;
        device.c_sync_rate.store(rate, Ordering::Relaxed);
        SLEEP_TIME * rate / (u64::from(BM_BLOCK_SIZE / 1024) * HZ)
    }
}

/// Reset the controller between runs.
pub fn rs_controller_reset(device: &Device) {
    device.rs_sect_in.store(0, Ordering::Relaxed);
    device.rs_sect_ev.store(0, Ordering::Relaxed);
    let mut rate = device.rate();
    rate.rs_in_flight = 0;
    rate.rs_planed = 0;
    rate.fifo.set_all(0);
}
