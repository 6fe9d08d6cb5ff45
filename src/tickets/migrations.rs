pub fn create_ticket_tables_migration() -> &'static str {
    r#"
    CREATE TABLE IF NOT EXISTS tickets (
        id UUID PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        email VARCHAR(255) NOT NULL,
        subject VARCHAR(500) NOT NULL,
        message TEXT NOT NULL,
        status VARCHAR(32) NOT NULL DEFAULT 'open',
        rating INTEGER CHECK (rating IS NULL OR rating BETWEEN 0 AND 5),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS ticket_replies (
        id UUID PRIMARY KEY,
        ticket_id UUID NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
        admin_name VARCHAR(255) NOT NULL,
        is_from_guest BOOLEAN DEFAULT FALSE,
        message TEXT NOT NULL,
        notice VARCHAR(32),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS ticket_status_logs (
        id UUID PRIMARY KEY,
        ticket_id UUID NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
        old_status VARCHAR(32),
        new_status VARCHAR(32),
        created_at TIMESTAMPTZ DEFAULT NOW()
    );

    CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
    CREATE INDEX IF NOT EXISTS idx_tickets_email ON tickets(email);
    CREATE INDEX IF NOT EXISTS idx_tickets_created ON tickets(created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_ticket_replies_ticket ON ticket_replies(ticket_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_ticket_status_logs_ticket ON ticket_status_logs(ticket_id, created_at);
    "#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_is_idempotent_sql() {
        let sql = create_ticket_tables_migration();
        assert_eq!(sql.matches("CREATE TABLE IF NOT EXISTS").count(), 3);
        assert!(!sql.contains("CREATE TABLE tickets"));
    }
}
