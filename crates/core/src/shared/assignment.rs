use pathfinding::kuhn_munkres::kuhn_munkres_min;
use pathfinding::matrix::Matrix;

/// Cost values at or above this are treated as "no pairing possible".
pub const INFEASIBLE: f64 = f64::INFINITY;

/// Integer scale used when feeding f64 costs to the Kuhn-Munkres solver.
const COST_SCALE: f64 = 1000.0;

/// Sentinel weight standing in for an infeasible pairing inside the
/// integer matrix. Large enough to never win, small enough to not
/// overflow when summed over a full assignment.
const SENTINEL: i64 = i64::MAX / 1_000_000;

/// Solves a minimum-cost row-to-column assignment over an f64 cost matrix.
///
/// Pairs whose cost exceeds `max_cost` are never returned. Uses optimal
/// linear assignment (Kuhn-Munkres) when every entry is finite and falls
/// back to greedy ascending-cost matching otherwise; both paths honour
/// the `max_cost` gate.
///
/// Ties are deterministic: equal-cost alternatives resolve by ascending
/// row index, then ascending column index.
///
/// Returns `(row, column)` pairs sorted by row.
pub fn min_cost_assignment(costs: &[Vec<f64>], max_cost: f64) -> Vec<(usize, usize)> {
    let rows = costs.len();
    let cols = costs.first().map_or(0, |r| r.len());
    if rows == 0 || cols == 0 {
        return Vec::new();
    }

    let all_finite = costs.iter().flatten().all(|c| c.is_finite());
    let mut matches = if all_finite {
        optimal_assignment(costs, rows, cols, max_cost)
    } else {
        greedy_assignment(costs, max_cost)
    };
    matches.sort_unstable();
    matches
}

/// Kuhn-Munkres over a scaled integer matrix. The solver requires
/// rows <= columns, so wide-side matrices are solved transposed.
fn optimal_assignment(
    costs: &[Vec<f64>],
    rows: usize,
    cols: usize,
    max_cost: f64,
) -> Vec<(usize, usize)> {
    let transposed = rows > cols;
    let (n_rows, n_cols) = if transposed { (cols, rows) } else { (rows, cols) };

    let weights = Matrix::from_fn(n_rows, n_cols, |(r, c)| {
        let cost = if transposed { costs[c][r] } else { costs[r][c] };
        if cost > max_cost {
            SENTINEL
        } else {
            (cost * COST_SCALE).round() as i64
        }
    });

    let (_, cols_for_rows) = kuhn_munkres_min(&weights);

    let mut matches = Vec::new();
    for (r, c) in cols_for_rows.into_iter().enumerate() {
        let (row, col) = if transposed { (c, r) } else { (r, c) };
        if costs[row][col] <= max_cost {
            matches.push((row, col));
        }
    }
    matches
}

/// Greedy ascending-cost matching. Deterministic: stable sort keeps
/// (row, col) order among equal costs.
fn greedy_assignment(costs: &[Vec<f64>], max_cost: f64) -> Vec<(usize, usize)> {
    let mut pairs: Vec<(usize, usize, f64)> = Vec::new();
    for (r, row) in costs.iter().enumerate() {
        for (c, &cost) in row.iter().enumerate() {
            if cost.is_finite() && cost <= max_cost {
                pairs.push((r, c, cost));
            }
        }
    }
    pairs.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

    let mut used_rows = vec![false; costs.len()];
    let mut used_cols = vec![false; costs.first().map_or(0, |r| r.len())];
    let mut matches = Vec::new();
    for (r, c, _) in pairs {
        if !used_rows[r] && !used_cols[c] {
            used_rows[r] = true;
            used_cols[c] = true;
            matches.push((r, c));
        }
    }
    matches
}
