use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS transactions (
            id                       INTEGER PRIMARY KEY AUTOINCREMENT,
            from_address             TEXT NOT NULL,
            to_address               TEXT,
            input                    TEXT NOT NULL,
            created_contract_address TEXT,
            block_timestamp          INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS contracts (
            to_address      TEXT PRIMARY KEY,
            tags            TEXT NOT NULL,
            block_timestamp INTEGER NOT NULL,
            updated_at      INTEGER
        );

        CREATE TABLE IF NOT EXISTS signatures (
            to_address      TEXT NOT NULL,
            signature       TEXT NOT NULL,
            invocations     INTEGER,
            tags            TEXT NOT NULL,
            block_timestamp INTEGER NOT NULL,
            updated_at      INTEGER,
            PRIMARY KEY (to_address, signature)
        );

        CREATE TABLE IF NOT EXISTS callers (
            caller          TEXT NOT NULL,
            to_address      TEXT NOT NULL,
            tags            TEXT NOT NULL,
            block_timestamp INTEGER NOT NULL,
            updated_at      INTEGER,
            PRIMARY KEY (caller, to_address)
        );

        CREATE TABLE IF NOT EXISTS smart_contracts (
            address_hash TEXT PRIMARY KEY,
            name         TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_transactions_time ON transactions(block_timestamp);
        CREATE INDEX IF NOT EXISTS idx_transactions_created ON transactions(created_contract_address);
        ",
    )?;
    Ok(())
}
