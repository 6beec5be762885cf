use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (users, orders, audit trail)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id                      TEXT PRIMARY KEY,
                username                TEXT NOT NULL UNIQUE,
                email                   TEXT NOT NULL,
                total_compensation      INTEGER NOT NULL DEFAULT 0,
                status                  TEXT NOT NULL DEFAULT 'active'
                                        CHECK (status IN ('active', 'inactive')),
                sequence_number         INTEGER NOT NULL UNIQUE,
                compensation_category   TEXT NOT NULL
                                        CHECK (compensation_category IN ('staged_raffle', 'submission_count')),
                created_at              INTEGER NOT NULL
            );

            -- Explicit counters, bumped inside the transaction that consumes them
            CREATE TABLE sequences (
                name    TEXT PRIMARY KEY,
                value   INTEGER NOT NULL
            );

            INSERT INTO sequences (name, value) VALUES ('users', 0);

            CREATE TABLE orders (
                order_id                                    TEXT PRIMARY KEY,
                user_id                                     TEXT REFERENCES users(id)
                                                            ON UPDATE CASCADE ON DELETE SET NULL,
                channel_id                                  TEXT NOT NULL UNIQUE,
                compensation                                INTEGER NOT NULL DEFAULT 0,
                app_used                                    TEXT,
                status                                      TEXT NOT NULL CHECK (status IN (
                                                                'awaiting_app_selection',
                                                                'awaiting_initial_screenshot',
                                                                'verifying_initial_data',
                                                                'awaiting_completion_screenshot',
                                                                'verifying_completion_data',
                                                                'collecting_missing_info',
                                                                'completed',
                                                                'rejected')),
                resume_stage                                TEXT CHECK (resume_stage IN ('initial', 'completion')),

                restaurant_name                             TEXT,
                is_restaurant_name_verified                 INTEGER NOT NULL DEFAULT 0,
                restaurant_address                          TEXT,
                is_restaurant_address_verified              INTEGER NOT NULL DEFAULT 0,
                order_placement_time                        INTEGER,
                is_order_placement_time_verified            INTEGER NOT NULL DEFAULT 0,
                earliest_estimated_arrival_time             INTEGER,
                is_earliest_estimated_arrival_time_verified INTEGER NOT NULL DEFAULT 0,
                latest_estimated_arrival_time               INTEGER,
                is_latest_estimated_arrival_time_verified   INTEGER NOT NULL DEFAULT 0,
                order_completion_time                       INTEGER,
                is_order_completion_time_verified           INTEGER NOT NULL DEFAULT 0,

                placement_screenshot_path                   TEXT,
                completion_screenshot_path                  TEXT,
                field_sources                               TEXT NOT NULL DEFAULT '{}',
                extraction_failures                         INTEGER NOT NULL DEFAULT 0,
                missing_info_since                          INTEGER,
                rejection_reason                            TEXT,
                compensation_awarded_at                     INTEGER,
                version                                     INTEGER NOT NULL DEFAULT 1,
                created_at                                  INTEGER NOT NULL,
                updated_at                                  INTEGER NOT NULL,

                -- verified implies present
                CHECK (is_restaurant_name_verified = 0
                       OR (restaurant_name IS NOT NULL AND trim(restaurant_name) <> '')),
                CHECK (is_restaurant_address_verified = 0
                       OR (restaurant_address IS NOT NULL AND trim(restaurant_address) <> '')),
                CHECK (is_order_placement_time_verified = 0
                       OR (order_placement_time IS NOT NULL AND order_placement_time > 0)),
                CHECK (is_earliest_estimated_arrival_time_verified = 0
                       OR (earliest_estimated_arrival_time IS NOT NULL AND earliest_estimated_arrival_time > 0)),
                CHECK (is_latest_estimated_arrival_time_verified = 0
                       OR (latest_estimated_arrival_time IS NOT NULL AND latest_estimated_arrival_time > 0)),
                CHECK (is_order_completion_time_verified = 0
                       OR (order_completion_time IS NOT NULL AND order_completion_time > 0)),

                CHECK (status <> 'collecting_missing_info' OR resume_stage IS NOT NULL),
                CHECK (status <> 'completed' OR (
                       is_restaurant_name_verified = 1
                       AND is_restaurant_address_verified = 1
                       AND is_order_placement_time_verified = 1
                       AND is_earliest_estimated_arrival_time_verified = 1
                       AND is_latest_estimated_arrival_time_verified = 1
                       AND is_order_completion_time_verified = 1)),
                CHECK (compensation = 0 OR status = 'completed')
            );

            CREATE INDEX idx_orders_user ON orders(user_id, created_at);
            CREATE INDEX idx_orders_status ON orders(status);

            CREATE TABLE order_versions (
                order_id    TEXT NOT NULL REFERENCES orders(order_id),
                version     INTEGER NOT NULL,
                change      TEXT NOT NULL,
                snapshot    TEXT NOT NULL,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (order_id, version)
            );

            CREATE TABLE raffle_entries (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id    TEXT NOT NULL UNIQUE REFERENCES orders(order_id),
                user_id     TEXT REFERENCES users(id) ON UPDATE CASCADE ON DELETE SET NULL,
                stage       INTEGER NOT NULL,
                created_at  INTEGER NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
