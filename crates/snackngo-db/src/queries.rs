use crate::Database;
use crate::models::{AwardRow, CommitOutcome, OrderRow, OrderVersionRow, RaffleEntryRow, UserRow};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, Row, named_params};
use snackngo_types::models::CompensationCategory;

const USER_COLUMNS: &str = "id, username, email, total_compensation, status, sequence_number, \
     compensation_category, created_at";

const ORDER_COLUMNS: &str = "order_id, user_id, channel_id, compensation, app_used, status, resume_stage, \
     restaurant_name, is_restaurant_name_verified, \
     restaurant_address, is_restaurant_address_verified, \
     order_placement_time, is_order_placement_time_verified, \
     earliest_estimated_arrival_time, is_earliest_estimated_arrival_time_verified, \
     latest_estimated_arrival_time, is_latest_estimated_arrival_time_verified, \
     order_completion_time, is_order_completion_time_verified, \
     placement_screenshot_path, completion_screenshot_path, field_sources, \
     extraction_failures, missing_info_since, rejection_reason, compensation_awarded_at, \
     version, created_at, updated_at";

impl Database {
    // -- Users --

    /// Create a user, assigning the next sequence number and its compensation
    /// category in the same transaction. Returns `None` if the username is taken.
    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        email: &str,
        now: i64,
    ) -> Result<Option<UserRow>> {
        self.with_tx(|tx| {
            let taken: Option<String> = tx
                .query_row("SELECT id FROM users WHERE username = ?1", [username], |row| {
                    row.get(0)
                })
                .optional()?;
            if taken.is_some() {
                return Ok(None);
            }

            let sequence_number: i64 = tx.query_row(
                "UPDATE sequences SET value = value + 1 WHERE name = 'users' RETURNING value",
                [],
                |row| row.get(0),
            )?;
            let category = CompensationCategory::for_sequence(sequence_number);

            tx.execute(
                "INSERT INTO users (id, username, email, status, sequence_number, compensation_category, created_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6)",
                rusqlite::params![id, username, email, sequence_number, category.as_str(), now],
            )?;

            query_user_by_id(tx, id)?.ok_or_else(|| anyhow!("User vanished after insert: {}", id)).map(Some)
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS);
            Ok(conn.query_row(&sql, [username], user_from_row).optional()?)
        })
    }

    pub fn list_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users ORDER BY sequence_number", USER_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns false if the user does not exist.
    pub fn set_user_status(&self, id: &str, status: &str) -> Result<bool> {
        self.with_tx(|tx| {
            let changed = tx.execute("UPDATE users SET status = ?1 WHERE id = ?2", [status, id])?;
            Ok(changed > 0)
        })
    }

    // -- Orders --

    /// Insert a new order with its first audit snapshot. Returns false if the
    /// channel is already bound to an order.
    pub fn insert_order(&self, row: &OrderRow, change: &str, snapshot: &str) -> Result<bool> {
        self.with_tx(|tx| {
            let bound: Option<String> = tx
                .query_row(
                    "SELECT order_id FROM orders WHERE channel_id = ?1",
                    [&row.channel_id],
                    |r| r.get(0),
                )
                .optional()?;
            if bound.is_some() {
                return Ok(false);
            }

            let sql = format!(
                "INSERT INTO orders ({}) VALUES (
                    :order_id, :user_id, :channel_id, :compensation, :app_used, :status, :resume_stage,
                    :restaurant_name, :is_restaurant_name_verified,
                    :restaurant_address, :is_restaurant_address_verified,
                    :order_placement_time, :is_order_placement_time_verified,
                    :earliest_estimated_arrival_time, :is_earliest_estimated_arrival_time_verified,
                    :latest_estimated_arrival_time, :is_latest_estimated_arrival_time_verified,
                    :order_completion_time, :is_order_completion_time_verified,
                    :placement_screenshot_path, :completion_screenshot_path, :field_sources,
                    :extraction_failures, :missing_info_since, :rejection_reason, :compensation_awarded_at,
                    :version, :created_at, :updated_at)",
                ORDER_COLUMNS
            );
            execute_order_statement(tx, &sql, row, None)?;
            insert_version(tx, row, change, snapshot)?;
            Ok(true)
        })
    }

    pub fn get_order(&self, order_id: &str) -> Result<Option<OrderRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM orders WHERE order_id = ?1", ORDER_COLUMNS);
            Ok(conn.query_row(&sql, [order_id], order_from_row).optional()?)
        })
    }

    pub fn get_order_by_channel(&self, channel_id: &str) -> Result<Option<OrderRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM orders WHERE channel_id = ?1", ORDER_COLUMNS);
            Ok(conn.query_row(&sql, [channel_id], order_from_row).optional()?)
        })
    }

    pub fn list_orders_for_user(&self, user_id: &str) -> Result<Vec<OrderRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM orders WHERE user_id = ?1 ORDER BY created_at DESC",
                ORDER_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], order_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_orders_in_status(&self, status: &str) -> Result<Vec<OrderRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM orders WHERE status = ?1 ORDER BY created_at",
                ORDER_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([status], order_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Write `row` if the stored version still equals `expected_version`.
    ///
    /// The order row, its audit snapshot and the optional award are one
    /// transaction: either all of them land or none do.
    pub fn commit_order(
        &self,
        row: &OrderRow,
        expected_version: i64,
        change: &str,
        snapshot: &str,
        award: Option<&AwardRow>,
    ) -> Result<CommitOutcome> {
        self.with_tx(|tx| {
            let sql = "UPDATE orders SET
                    user_id = :user_id, channel_id = :channel_id, compensation = :compensation,
                    app_used = :app_used, status = :status, resume_stage = :resume_stage,
                    restaurant_name = :restaurant_name,
                    is_restaurant_name_verified = :is_restaurant_name_verified,
                    restaurant_address = :restaurant_address,
                    is_restaurant_address_verified = :is_restaurant_address_verified,
                    order_placement_time = :order_placement_time,
                    is_order_placement_time_verified = :is_order_placement_time_verified,
                    earliest_estimated_arrival_time = :earliest_estimated_arrival_time,
                    is_earliest_estimated_arrival_time_verified = :is_earliest_estimated_arrival_time_verified,
                    latest_estimated_arrival_time = :latest_estimated_arrival_time,
                    is_latest_estimated_arrival_time_verified = :is_latest_estimated_arrival_time_verified,
                    order_completion_time = :order_completion_time,
                    is_order_completion_time_verified = :is_order_completion_time_verified,
                    placement_screenshot_path = :placement_screenshot_path,
                    completion_screenshot_path = :completion_screenshot_path,
                    field_sources = :field_sources,
                    extraction_failures = :extraction_failures,
                    missing_info_since = :missing_info_since,
                    rejection_reason = :rejection_reason,
                    compensation_awarded_at = :compensation_awarded_at,
                    version = :version, created_at = :created_at, updated_at = :updated_at
                 WHERE order_id = :order_id AND version = :expected_version";

            let changed = execute_order_statement(tx, sql, row, Some(expected_version))?;
            if changed == 0 {
                let stored: Option<i64> = tx
                    .query_row(
                        "SELECT version FROM orders WHERE order_id = ?1",
                        [&row.order_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                return Ok(CommitOutcome::VersionConflict { stored });
            }

            insert_version(tx, row, change, snapshot)?;

            let mut raffle_stage = None;
            if let Some(award) = award {
                tx.execute(
                    "UPDATE users SET total_compensation = total_compensation + ?1 WHERE id = ?2",
                    rusqlite::params![award.amount, award.user_id],
                )?;

                if award.raffle_entry {
                    let stage: i64 = tx.query_row(
                        "SELECT COUNT(*) FROM orders WHERE user_id = ?1 AND status = 'completed'",
                        [&award.user_id],
                        |r| r.get(0),
                    )?;
                    tx.execute(
                        "INSERT INTO raffle_entries (order_id, user_id, stage, created_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![row.order_id, award.user_id, stage, row.updated_at],
                    )?;
                    raffle_stage = Some(stage);
                }
            }

            Ok(CommitOutcome::Committed { raffle_stage })
        })
    }

    /// Audit trail of an order, oldest version first.
    pub fn order_history(&self, order_id: &str) -> Result<Vec<OrderVersionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT order_id, version, change, snapshot, recorded_at
                 FROM order_versions WHERE order_id = ?1 ORDER BY version",
            )?;
            let rows = stmt
                .query_map([order_id], |row| {
                    Ok(OrderVersionRow {
                        order_id: row.get(0)?,
                        version: row.get(1)?,
                        change: row.get(2)?,
                        snapshot: row.get(3)?,
                        recorded_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn raffle_entries_for_user(&self, user_id: &str) -> Result<Vec<RaffleEntryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT order_id, user_id, stage, created_at
                 FROM raffle_entries WHERE user_id = ?1 ORDER BY stage",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(RaffleEntryRow {
                        order_id: row.get(0)?,
                        user_id: row.get(1)?,
                        stage: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    Ok(conn.query_row(&sql, [id], user_from_row).optional()?)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        total_compensation: row.get(3)?,
        status: row.get(4)?,
        sequence_number: row.get(5)?,
        compensation_category: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<OrderRow> {
    Ok(OrderRow {
        order_id: row.get(0)?,
        user_id: row.get(1)?,
        channel_id: row.get(2)?,
        compensation: row.get(3)?,
        app_used: row.get(4)?,
        status: row.get(5)?,
        resume_stage: row.get(6)?,
        restaurant_name: row.get(7)?,
        is_restaurant_name_verified: row.get(8)?,
        restaurant_address: row.get(9)?,
        is_restaurant_address_verified: row.get(10)?,
        order_placement_time: row.get(11)?,
        is_order_placement_time_verified: row.get(12)?,
        earliest_estimated_arrival_time: row.get(13)?,
        is_earliest_estimated_arrival_time_verified: row.get(14)?,
        latest_estimated_arrival_time: row.get(15)?,
        is_latest_estimated_arrival_time_verified: row.get(16)?,
        order_completion_time: row.get(17)?,
        is_order_completion_time_verified: row.get(18)?,
        placement_screenshot_path: row.get(19)?,
        completion_screenshot_path: row.get(20)?,
        field_sources: row.get(21)?,
        extraction_failures: row.get(22)?,
        missing_info_since: row.get(23)?,
        rejection_reason: row.get(24)?,
        compensation_awarded_at: row.get(25)?,
        version: row.get(26)?,
        created_at: row.get(27)?,
        updated_at: row.get(28)?,
    })
}

/// Bind every order column by name. `expected_version` is only bound for UPDATEs.
fn execute_order_statement(
    conn: &Connection,
    sql: &str,
    row: &OrderRow,
    expected_version: Option<i64>,
) -> Result<usize> {
    let mut stmt = conn.prepare(sql)?;
    let params = named_params! {
        ":order_id": row.order_id,
        ":user_id": row.user_id,
        ":channel_id": row.channel_id,
        ":compensation": row.compensation,
        ":app_used": row.app_used,
        ":status": row.status,
        ":resume_stage": row.resume_stage,
        ":restaurant_name": row.restaurant_name,
        ":is_restaurant_name_verified": row.is_restaurant_name_verified,
        ":restaurant_address": row.restaurant_address,
        ":is_restaurant_address_verified": row.is_restaurant_address_verified,
        ":order_placement_time": row.order_placement_time,
        ":is_order_placement_time_verified": row.is_order_placement_time_verified,
        ":earliest_estimated_arrival_time": row.earliest_estimated_arrival_time,
        ":is_earliest_estimated_arrival_time_verified": row.is_earliest_estimated_arrival_time_verified,
        ":latest_estimated_arrival_time": row.latest_estimated_arrival_time,
        ":is_latest_estimated_arrival_time_verified": row.is_latest_estimated_arrival_time_verified,
        ":order_completion_time": row.order_completion_time,
        ":is_order_completion_time_verified": row.is_order_completion_time_verified,
        ":placement_screenshot_path": row.placement_screenshot_path,
        ":completion_screenshot_path": row.completion_screenshot_path,
        ":field_sources": row.field_sources,
        ":extraction_failures": row.extraction_failures,
        ":missing_info_since": row.missing_info_since,
        ":rejection_reason": row.rejection_reason,
        ":compensation_awarded_at": row.compensation_awarded_at,
        ":version": row.version,
        ":created_at": row.created_at,
        ":updated_at": row.updated_at,
    };

    let changed = match expected_version {
        Some(expected) => {
            let mut all: Vec<(&str, &dyn rusqlite::ToSql)> = params.to_vec();
            all.push((":expected_version", &expected));
            stmt.execute(all.as_slice())?
        }
        None => stmt.execute(params)?,
    };
    Ok(changed)
}

fn insert_version(conn: &Connection, row: &OrderRow, change: &str, snapshot: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO order_versions (order_id, version, change, snapshot, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![row.order_id, row.version, change, snapshot, row.updated_at],
    )?;
    Ok(())
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(order_id: &str, user_id: Option<&str>, channel_id: &str) -> OrderRow {
        OrderRow {
            order_id: order_id.into(),
            user_id: user_id.map(Into::into),
            channel_id: channel_id.into(),
            status: "awaiting_app_selection".into(),
            field_sources: "{}".into(),
            version: 1,
            created_at: 100,
            updated_at: 100,
            ..Default::default()
        }
    }

    fn completed(mut row: OrderRow, amount: i64) -> OrderRow {
        row.status = "completed".into();
        row.restaurant_name = Some("Cafe A".into());
        row.is_restaurant_name_verified = true;
        row.restaurant_address = Some("1 Main St".into());
        row.is_restaurant_address_verified = true;
        row.order_placement_time = Some(1_700_000_000);
        row.is_order_placement_time_verified = true;
        row.earliest_estimated_arrival_time = Some(1_700_001_000);
        row.is_earliest_estimated_arrival_time_verified = true;
        row.latest_estimated_arrival_time = Some(1_700_002_000);
        row.is_latest_estimated_arrival_time_verified = true;
        row.order_completion_time = Some(1_700_001_500);
        row.is_order_completion_time_verified = true;
        row.compensation = amount;
        row.compensation_awarded_at = Some(200);
        row.version += 1;
        row.updated_at = 200;
        row
    }

    #[test]
    fn sequence_numbers_are_consecutive() {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("u1", "amy", "amy@example.com", 1).unwrap().unwrap();
        let b = db.create_user("u2", "cyn", "cyn@example.com", 2).unwrap().unwrap();
        assert_eq!(a.sequence_number, 1);
        assert_eq!(a.compensation_category, "staged_raffle");
        assert_eq!(b.sequence_number, 2);
        assert_eq!(b.compensation_category, "submission_count");
    }

    #[test]
    fn duplicate_username_is_reported() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "amy", "amy@example.com", 1).unwrap();
        assert!(db.create_user("u2", "amy", "other@example.com", 2).unwrap().is_none());
        // The refused insert must not burn a sequence number.
        let c = db.create_user("u3", "sofia", "s@example.com", 3).unwrap().unwrap();
        assert_eq!(c.sequence_number, 2);
    }

    #[test]
    fn channel_binds_once() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "amy", "amy@example.com", 1).unwrap();
        assert!(db.insert_order(&order("o1", Some("u1"), "C1"), "created", "{}").unwrap());
        assert!(!db.insert_order(&order("o2", Some("u1"), "C1"), "created", "{}").unwrap());
        assert_eq!(db.get_order_by_channel("C1").unwrap().unwrap().order_id, "o1");
    }

    #[test]
    fn stale_version_is_a_conflict() {
        let db = Database::open_in_memory().unwrap();
        let row = order("o1", None, "C1");
        db.insert_order(&row, "created", "{}").unwrap();

        let mut next = row.clone();
        next.app_used = Some("uber_eats".into());
        next.version = 2;
        assert_eq!(
            db.commit_order(&next, 1, "app", "{}", None).unwrap(),
            CommitOutcome::Committed { raffle_stage: None }
        );

        let mut stale = row.clone();
        stale.app_used = Some("doordash".into());
        stale.version = 2;
        assert_eq!(
            db.commit_order(&stale, 1, "app", "{}", None).unwrap(),
            CommitOutcome::VersionConflict { stored: Some(2) }
        );

        let stored = db.get_order("o1").unwrap().unwrap();
        assert_eq!(stored.app_used.as_deref(), Some("uber_eats"));
        assert_eq!(db.order_history("o1").unwrap().len(), 2);
    }

    #[test]
    fn award_lands_with_the_order() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "amy", "amy@example.com", 1).unwrap();
        let row = order("o1", Some("u1"), "C1");
        db.insert_order(&row, "created", "{}").unwrap();

        let done = completed(row, 0);
        let award = AwardRow {
            user_id: "u1".into(),
            amount: 0,
            raffle_entry: true,
        };
        let outcome = db.commit_order(&done, 1, "completed", "{}", Some(&award)).unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { raffle_stage: Some(1) });
        assert_eq!(db.raffle_entries_for_user("u1").unwrap().len(), 1);
    }

    #[test]
    fn failed_award_rolls_back_the_order() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "amy", "amy@example.com", 1).unwrap();
        let row = order("o1", Some("u1"), "C1");
        db.insert_order(&row, "created", "{}").unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO raffle_entries (order_id, user_id, stage, created_at) VALUES ('o1', 'u1', 1, 0)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let award = AwardRow {
            user_id: "u1".into(),
            amount: 0,
            raffle_entry: true,
        };
        assert!(db.commit_order(&completed(row, 0), 1, "completed", "{}", Some(&award)).is_err());

        let stored = db.get_order("o1").unwrap().unwrap();
        assert_eq!(stored.status, "awaiting_app_selection");
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn deleting_a_user_keeps_the_order() {
        let db = Database::open_in_memory().unwrap();
        db.create_user("u1", "amy", "amy@example.com", 1).unwrap();
        db.insert_order(&order("o1", Some("u1"), "C1"), "created", "{}").unwrap();
        db.with_conn(|conn| {
            conn.execute("DELETE FROM users WHERE id = 'u1'", [])?;
            Ok(())
        })
        .unwrap();

        let stored = db.get_order("o1").unwrap().unwrap();
        assert_eq!(stored.user_id, None);
    }
}
