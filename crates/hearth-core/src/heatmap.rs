//! Price heatmap aggregation over a fixed coordinate grid.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::Property;

/// Default cell size in degrees (about 1 km of latitude).
pub const DEFAULT_GRID_SIZE: f64 = 0.01;

/// One grid cell of the heatmap.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapPoint {
    pub lat: f64,
    pub lng: f64,
    /// Mean price of the listings in the cell.
    pub price: f64,
    /// Mean overall score of the scored listings in the cell, 0 when none.
    pub score: f64,
    pub count: u32,
}

/// Snap a coordinate to its cell, truncating toward zero.
pub fn round_to_grid(value: f64, grid_size: f64) -> f64 {
    (value / grid_size).trunc() * grid_size
}

#[derive(Default)]
struct Cell {
    lat: f64,
    lng: f64,
    price_sum: f64,
    score_sum: f64,
    scored: u32,
    count: u32,
}

/// Aggregate listings (each with an optional overall score) into grid cells.
///
/// Listings without coordinates are skipped. Points come back ordered by
/// cell, south-west first.
pub fn aggregate_heatmap<'a, I>(listings: I, grid_size: f64) -> Vec<HeatmapPoint>
where
    I: IntoIterator<Item = (&'a Property, Option<f64>)>,
{
    let grid_size = if grid_size > 0.0 {
        grid_size
    } else {
        DEFAULT_GRID_SIZE
    };
    let mut cells: BTreeMap<(i64, i64), Cell> = BTreeMap::new();

    for (property, score) in listings {
        if !property.has_coordinates() {
            continue;
        }

        let key = (
            (property.latitude / grid_size).trunc() as i64,
            (property.longitude / grid_size).trunc() as i64,
        );
        let cell = cells.entry(key).or_insert_with(|| Cell {
            lat: round_to_grid(property.latitude, grid_size),
            lng: round_to_grid(property.longitude, grid_size),
            ..Default::default()
        });

        cell.price_sum += property.price;
        cell.count += 1;
        if let Some(score) = score.filter(|s| *s > 0.0) {
            cell.score_sum += score;
            cell.scored += 1;
        }
    }

    cells
        .into_values()
        .map(|cell| HeatmapPoint {
            lat: cell.lat,
            lng: cell.lng,
            price: cell.price_sum / f64::from(cell.count),
            score: if cell.scored > 0 {
                cell.score_sum / f64::from(cell.scored)
            } else {
                0.0
            },
            count: cell.count,
        })
        .collect()
}
