use std::collections::HashSet;
use std::fmt;
use tracing::{info, warn};

/// What the load engine should do with the destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationStatus {
    /// The destination table does not exist and must be created.
    DoesNotExist,
    /// The destination table matches the expected shape.
    Ok,
    /// A rebuild was requested; the table is recreated regardless of shape.
    NeedsRebuild,
    /// The destination has columns the source does not; loading would be
    /// unsafe, so the table is skipped.
    Incorrect,
}

impl fmt::Display for DestinationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationStatus::DoesNotExist => write!(f, "non-existent"),
            DestinationStatus::Ok => write!(f, "ok"),
            DestinationStatus::NeedsRebuild => write!(f, "rebuild"),
            DestinationStatus::Incorrect => write!(f, "incorrect"),
        }
    }
}

/// Diffs the destination's columns against the expected source shape.
///
/// `expected_columns` is the source column set minus dropped columns, i.e.
/// exactly the columns the generated extraction query selects. The function
/// is pure: identical inputs always produce the identical status.
///
/// Rules, in order:
/// - empty destination column set means the table does not exist;
/// - a requested rebuild short-circuits every shape check;
/// - equal sets load as-is;
/// - columns present only in the destination make the table unsafe to load;
/// - columns present only in the source are excluded from the load and only
///   warned about, since the bulk load ignores fields absent from the
///   destination.
pub fn reconcile(
    table: &str,
    expected_columns: &[String],
    destination_columns: &[String],
    rebuild: bool,
) -> DestinationStatus {
    let destination: HashSet<&str> = destination_columns.iter().map(String::as_str).collect();
    let expected: HashSet<&str> = expected_columns.iter().map(String::as_str).collect();

    if destination.is_empty() {
        info!(table, "destination table does not exist");
        return DestinationStatus::DoesNotExist;
    }

    if rebuild {
        // Shape checks are pointless on a table about to be dropped.
        info!(table, "attempting to rebuild destination table");
        return DestinationStatus::NeedsRebuild;
    }

    if destination == expected {
        return DestinationStatus::Ok;
    }

    let unexpected_destination: Vec<&str> =
        destination.difference(&expected).copied().collect();
    if !unexpected_destination.is_empty() {
        warn!(
            table,
            columns = ?unexpected_destination,
            "columns exist in the warehouse table that are not in the source"
        );
        return DestinationStatus::Incorrect;
    }

    let unexpected_source: Vec<&str> = expected.difference(&destination).copied().collect();
    warn!(
        table,
        columns = ?unexpected_source,
        "columns exist in the source table that are not in the warehouse, skipping them"
    );

    DestinationStatus::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_destination_does_not_exist() {
        let status = reconcile("t", &cols(&["a", "b"]), &[], false);
        assert_eq!(status, DestinationStatus::DoesNotExist);
    }

    #[test]
    fn rebuild_short_circuits_shape_checks() {
        let status = reconcile("t", &cols(&["a"]), &cols(&["a", "extra"]), true);
        assert_eq!(status, DestinationStatus::NeedsRebuild);
    }

    #[test]
    fn matching_shape_is_ok() {
        let status = reconcile("t", &cols(&["a", "b"]), &cols(&["b", "a"]), false);
        assert_eq!(status, DestinationStatus::Ok);
    }

    #[test]
    fn extra_destination_column_is_incorrect() {
        let status = reconcile("t", &cols(&["a"]), &cols(&["a", "legacy"]), false);
        assert_eq!(status, DestinationStatus::Incorrect);
    }

    #[test]
    fn extra_source_column_is_ok_with_warning() {
        let status = reconcile("t", &cols(&["a", "new_col"]), &cols(&["a"]), false);
        assert_eq!(status, DestinationStatus::Ok);
    }

    #[test]
    fn reconcile_is_pure() {
        let expected = cols(&["a", "b"]);
        let destination = cols(&["a", "b", "c"]);

        let first = reconcile("t", &expected, &destination, false);
        for _ in 0..10 {
            assert_eq!(reconcile("t", &expected, &destination, false), first);
        }
    }
}
