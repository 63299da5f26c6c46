use herald_db::{create_pool, run_migrations, DbRuntimeSettings};

#[test]
fn pool_and_migrations_produce_routing_schema() {
    let pool = create_pool(
        ":memory:",
        DbRuntimeSettings {
            busy_timeout_ms: 5_000,
            pool_max_size: 1,
        },
    )
    .expect("failed to create pool");
    let conn = pool.get().expect("failed to get connection");
    let applied = run_migrations(&conn).expect("failed to run migrations");
    assert_eq!(applied, 3);

    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .expect("failed to prepare table query");
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("failed to query tables")
        .map(|r| r.expect("failed to read table name"))
        .collect();

    assert_eq!(tables, vec!["_herald_migrations", "channels", "rules"]);
}

#[test]
fn deleting_a_channel_cascades_to_its_rules() {
    let pool = create_pool(
        ":memory:",
        DbRuntimeSettings {
            busy_timeout_ms: 5_000,
            pool_max_size: 1,
        },
    )
    .expect("failed to create pool");
    let conn = pool.get().expect("failed to get connection");
    run_migrations(&conn).expect("failed to run migrations");

    conn.execute("INSERT INTO channels (provider_id) VALUES ('slack')", [])
        .expect("failed to insert channel");
    conn.execute(
        "INSERT INTO rules (channel_id, filter) VALUES (1, 'watch')",
        [],
    )
    .expect("failed to insert rule");
    conn.execute("DELETE FROM channels WHERE id = 1", [])
        .expect("failed to delete channel");

    let remaining: i64 = conn
        .query_row("SELECT COUNT(*) FROM rules", [], |row| row.get(0))
        .expect("failed to count rules");
    assert_eq!(remaining, 0);
}
