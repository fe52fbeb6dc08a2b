/// Economics module: pricing of contention for held items.
///
/// An item starts at [`ITEM_REQUEST_COST`]. Every failed attempt to take a held
/// item charges a penalty proportional to the item's current value and inflates
/// that value by the same percentage. Penalties sit in escrow until the item
/// changes hands, at which point they are split between the holder and the miner.

/// Credits are fractional; all amounts on the ledger use this type.
pub type Credits = f64;

/// Base credits minted to the miner of every block.
pub const MINING_REWARD: Credits = 50.0;
/// Cost of requesting a free item, and the value every item resets to.
pub const ITEM_REQUEST_COST: Credits = 10.0;
/// Supply minted by the genesis block.
pub const GENESIS_CREDITS: Credits = 100.0;

/// 5% base increase per failed attempt.
pub const BASE_DEMAND_PERCENTAGE: f64 = 0.05;
/// +0.01% per prior failed attempt. Growth is unbounded.
pub const DEMAND_INCREMENT: f64 = 0.0001;

/// Share of escrow paid to the holder when an item changes hands.
pub const HOLDER_ESCROW_PERCENTAGE: f64 = 0.6667;
/// Share of escrow paid to the miner of the block in which the item changes hands.
pub const MINER_ESCROW_PERCENTAGE: f64 = 0.3333;

/// Tolerance used when re-checking amounts computed by another node.
pub const CREDIT_TOLERANCE: Credits = 1e-9;

/// Percentage (as a fraction) applied after `demand_count` prior failed attempts.
pub fn demand_percentage(demand_count: u64) -> f64 {
    BASE_DEMAND_PERCENTAGE + demand_count as f64 * DEMAND_INCREMENT
}

/// Penalty charged for a failed request against a held item.
pub fn penalty_amount(current_value: Credits, demand_count: u64) -> Credits {
    current_value * demand_percentage(demand_count)
}

/// Item value after a failed request has been recorded.
pub fn inflated_value(current_value: Credits, demand_count: u64) -> Credits {
    current_value * (1.0 + demand_percentage(demand_count))
}

/// Splits an escrow balance into `(holder_share, miner_share)`.
pub fn split_escrow(escrow: Credits) -> (Credits, Credits) {
    (
        escrow * HOLDER_ESCROW_PERCENTAGE,
        escrow * MINER_ESCROW_PERCENTAGE,
    )
}

/// Compare two credit amounts computed independently.
pub fn credits_eq(a: Credits, b: Credits) -> bool {
    (a - b).abs() <= CREDIT_TOLERANCE * a.abs().max(b.abs()).max(1.0)
}
