use std::cmp::Ordering;

use super::{Series, SeriesTable};
use crate::config::LimitType;

/// Keeps the `count` most extreme columns, most extreme first.
///
/// `Max` ranks by each column's peak (descending), `Min` by its trough
/// (ascending). Ties keep column order; columns without values go last.
pub fn reduce(table: SeriesTable, count: usize, selector: LimitType) -> SeriesTable {
    let SeriesTable { times, columns } = table;

    let mut ranked: Vec<(Option<f64>, Series)> = columns
        .into_iter()
        .map(|column| {
            let key = match selector {
                LimitType::Max => column.max(),
                LimitType::Min => column.min(),
            };
            (key, column)
        })
        .collect();

    ranked.sort_by(|(a, _), (b, _)| match (a, b) {
        (Some(a), Some(b)) => match selector {
            LimitType::Max => b.total_cmp(a),
            LimitType::Min => a.total_cmp(b),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    ranked.truncate(count);

    SeriesTable {
        times,
        columns: ranked.into_iter().map(|(_, column)| column).collect(),
    }
}
