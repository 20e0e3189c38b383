//! SQLite session store
//!
//! Durable backend with schema migrations. All statements run behind one
//! connection mutex; fetch results are written in a single transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction};

use crate::crypto::{
    EphemeralKeypair, ExchangePublicKey, PublicKey, SignatureBytes, SymmetricKey,
};
use crate::model::{
    Contact, ContactId, Direction, ExchangeKeyRecord, FetchResults, Message, PendingOffer,
    RecordId, SessionKey, StoredFetch,
};

use super::{PostedMessage, SessionStore, StoreError, StoreResult};

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

/// SQLite-backed session store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and migrate it
    pub fn new<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(failed("open database"))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(failed("set pragmas"))?;

        Self::from_connection(conn)
    }

    /// Fresh in-memory database
    pub fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(failed("open in-memory database"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(failed("enable foreign keys"))?;
        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn run_migrations(conn: &Connection) -> StoreResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )
        .map_err(failed("create schema_version"))?;

        let current: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .map_err(failed("read schema version"))?;

        if current > SCHEMA_VERSION {
            return Err(StoreError::DataCorruption(format!(
                "database schema {} is newer than supported {}",
                current, SCHEMA_VERSION
            )));
        }
        if current < 1 {
            Self::migrate_v1(conn)?;
        }

        Ok(())
    }

    fn migrate_v1(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                verification_key BLOB NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS exchange_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contact_id INTEGER NOT NULL REFERENCES contacts(id),
                public_key BLOB NOT NULL,
                initial_key BLOB,
                matched INTEGER NOT NULL DEFAULT 0,
                received_at TEXT NOT NULL,
                UNIQUE(contact_id, public_key)
            );
            CREATE INDEX IF NOT EXISTS idx_exchange_keys_unmatched
                ON exchange_keys(matched) WHERE initial_key IS NULL;

            CREATE TABLE IF NOT EXISTS pending_offers (
                public_key BLOB PRIMARY KEY,
                contact_id INTEGER NOT NULL REFERENCES contacts(id),
                secret_key BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contact_id INTEGER NOT NULL REFERENCES contacts(id),
                key BLOB NOT NULL,
                derived_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_session_keys_contact
                ON session_keys(contact_id, derived_at);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contact_id INTEGER NOT NULL REFERENCES contacts(id),
                direction TEXT NOT NULL,
                plaintext TEXT,
                ciphertext TEXT NOT NULL,
                nonce TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                signature BLOB NOT NULL UNIQUE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_contact
                ON messages(contact_id, timestamp);

            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(failed("migration v1"))?;

        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_contact(conn: &Connection, id: ContactId) -> StoreResult<()> {
        let found = conn
            .query_row("SELECT 1 FROM contacts WHERE id = ?1", params![id], |_| Ok(()))
            .optional()
            .map_err(failed("look up contact"))?;
        found.ok_or_else(|| StoreError::NotFound(format!("contact {}", id)))
    }

    fn insert_exchange_key(
        tx: &Transaction<'_>,
        contact_id: ContactId,
        public_key: &ExchangePublicKey,
        initial_key: Option<&ExchangePublicKey>,
        matched: bool,
        received_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        Self::require_contact(tx, contact_id)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO exchange_keys
                     (contact_id, public_key, initial_key, matched, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    contact_id,
                    &public_key.as_bytes()[..],
                    initial_key.map(|k| k.as_bytes().to_vec()),
                    matched,
                    encode_time(received_at),
                ],
            )
            .map_err(failed("insert exchange key"))?;
        Ok(inserted > 0)
    }

    fn insert_session_key(conn: &Connection, key: &SessionKey) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO session_keys (contact_id, key, derived_at) VALUES (?1, ?2, ?3)",
            params![
                key.contact_id,
                &key.key.as_bytes()[..],
                encode_time(key.derived_at)
            ],
        )
        .map_err(failed("insert session key"))?;
        Ok(())
    }

    fn message_by_id(conn: &Connection, id: i64) -> StoreResult<Message> {
        let raw = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_MESSAGE),
                params![id],
                RawMessage::from_row,
            )
            .map_err(failed("read message"))?;
        raw.decode()
    }
}

impl SessionStore for SqliteStore {
    fn contacts(&self) -> StoreResult<Vec<Contact>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT id, name, verification_key FROM contacts ORDER BY id")
            .map_err(failed("list contacts"))?;
        let rows = stmt
            .query_map([], RawContact::from_row)
            .map_err(failed("list contacts"))?;
        collect(rows, "list contacts", RawContact::decode)
    }

    fn contact(&self, id: ContactId) -> StoreResult<Option<Contact>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name, verification_key FROM contacts WHERE id = ?1",
            params![id],
            RawContact::from_row,
        )
        .optional()
        .map_err(failed("load contact"))?
        .map(RawContact::decode)
        .transpose()
    }

    fn contacts_with_keys(&self) -> StoreResult<Vec<PublicKey>> {
        Ok(self
            .contacts()?
            .into_iter()
            .map(|c| c.verification_key)
            .collect())
    }

    fn contacts_without_session_key(&self) -> StoreResult<Vec<Contact>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT c.id, c.name, c.verification_key FROM contacts c
                 WHERE NOT EXISTS (SELECT 1 FROM session_keys k WHERE k.contact_id = c.id)
                   AND NOT EXISTS (SELECT 1 FROM pending_offers p WHERE p.contact_id = c.id)
                 ORDER BY c.id",
            )
            .map_err(failed("list contacts without keys"))?;
        let rows = stmt
            .query_map([], RawContact::from_row)
            .map_err(failed("list contacts without keys"))?;
        collect(rows, "list contacts without keys", RawContact::decode)
    }

    fn unmatched_exchange_keys(&self) -> StoreResult<Vec<ExchangeKeyRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, contact_id, public_key, initial_key, matched, received_at
                 FROM exchange_keys
                 WHERE matched = 0 AND initial_key IS NULL
                 ORDER BY id",
            )
            .map_err(failed("list unmatched keys"))?;
        let rows = stmt
            .query_map([], RawExchangeKey::from_row)
            .map_err(failed("list unmatched keys"))?;
        collect(rows, "list unmatched keys", RawExchangeKey::decode)
    }

    fn session_keys(&self, contact_id: ContactId) -> StoreResult<Vec<SessionKey>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT contact_id, key, derived_at FROM session_keys
                 WHERE contact_id = ?1
                 ORDER BY derived_at DESC, id DESC",
            )
            .map_err(failed("list session keys"))?;
        let rows = stmt
            .query_map(params![contact_id], |row| {
                Ok((
                    row.get::<_, ContactId>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(failed("list session keys"))?;
        collect(rows, "list session keys", |(contact_id, key, derived_at)| {
            Ok(SessionKey {
                contact_id,
                key: SymmetricKey::from_slice(&key).map_err(corrupt("session key"))?,
                derived_at: decode_time(&derived_at)?,
            })
        })
    }

    fn messages(&self, contact_id: ContactId) -> StoreResult<Vec<Message>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE contact_id = ?1 ORDER BY timestamp, id",
                SELECT_MESSAGE
            ))
            .map_err(failed("list messages"))?;
        let rows = stmt
            .query_map(params![contact_id], RawMessage::from_row)
            .map_err(failed("list messages"))?;
        collect(rows, "list messages", RawMessage::decode)
    }

    fn pending_offers(&self) -> StoreResult<Vec<PendingOffer>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT contact_id, secret_key FROM pending_offers ORDER BY rowid")
            .map_err(failed("list pending offers"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, ContactId>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(failed("list pending offers"))?;
        collect(rows, "list pending offers", |(contact_id, secret)| {
            let secret = <[u8; 32]>::try_from(secret.as_slice())
                .map_err(|_| StoreError::DataCorruption("pending offer secret".to_string()))?;
            Ok(PendingOffer {
                contact_id,
                keypair: EphemeralKeypair::from_secret_bytes(secret),
            })
        })
    }

    fn add_contact(&self, name: &str, verification_key: PublicKey) -> StoreResult<Contact> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO contacts (name, verification_key) VALUES (?1, ?2)",
            params![name, &verification_key.as_bytes()[..]],
        );

        match result {
            Ok(_) => Ok(Contact {
                id: conn.last_insert_rowid(),
                name: name.to_string(),
                verification_key,
            }),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::AlreadyExists(format!(
                    "contact with key {}",
                    verification_key
                )))
            }
            Err(e) => Err(StoreError::OperationFailed(format!(
                "failed to add contact: {}",
                e
            ))),
        }
    }

    fn store_fetch_results(&self, results: FetchResults) -> StoreResult<StoredFetch> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(failed("begin fetch write"))?;
        let mut stored = StoredFetch::default();

        for offer in results.offers {
            if Self::insert_exchange_key(
                &tx,
                offer.contact_id,
                &offer.public_key,
                None,
                false,
                offer.received_at,
            )? {
                stored.new_offers.push(offer.contact_id);
            }
        }

        for response in results.completed {
            if !Self::insert_exchange_key(
                &tx,
                response.contact_id,
                &response.public_key,
                Some(&response.initial_key),
                true,
                response.received_at,
            )? {
                continue;
            }
            tx.execute(
                "DELETE FROM pending_offers WHERE public_key = ?1",
                params![&response.initial_key.as_bytes()[..]],
            )
            .map_err(failed("clear pending offer"))?;
            Self::insert_session_key(&tx, &response.session_key)?;
            stored.completed.push(response.contact_id);
        }

        for message in results.messages {
            Self::require_contact(&tx, message.contact_id)?;
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO messages
                         (contact_id, direction, plaintext, ciphertext, nonce, timestamp, signature)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        message.contact_id,
                        message.direction.as_str(),
                        message.plaintext,
                        message.ciphertext,
                        message.nonce,
                        encode_time(message.timestamp),
                        &message.signature.as_bytes()[..],
                    ],
                )
                .map_err(failed("insert message"))?;
            if inserted > 0 {
                stored.new_messages.push(message.contact_id);
            }
        }

        tx.commit().map_err(failed("commit fetch write"))?;
        Ok(stored)
    }

    fn store_matched_offer(&self, record_id: RecordId, key: SessionKey) -> StoreResult<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(failed("begin match write"))?;

        let matched: Option<bool> = tx
            .query_row(
                "SELECT matched FROM exchange_keys WHERE id = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(failed("load exchange key"))?;

        match matched {
            None => return Err(StoreError::NotFound(format!("exchange key {}", record_id))),
            Some(true) => return Ok(false),
            Some(false) => {}
        }

        tx.execute(
            "UPDATE exchange_keys SET matched = 1 WHERE id = ?1 AND matched = 0",
            params![record_id],
        )
        .map_err(failed("mark exchange key matched"))?;
        Self::insert_session_key(&tx, &key)?;

        tx.commit().map_err(failed("commit match write"))?;
        Ok(true)
    }

    fn store_posted_offer(
        &self,
        contact_id: ContactId,
        keypair: &EphemeralKeypair,
    ) -> StoreResult<()> {
        let conn = self.lock();
        Self::require_contact(&conn, contact_id)?;
        conn.execute(
            "INSERT OR REPLACE INTO pending_offers (public_key, contact_id, secret_key)
             VALUES (?1, ?2, ?3)",
            params![
                &keypair.public_key().as_bytes()[..],
                contact_id,
                &keypair.secret_bytes()[..],
            ],
        )
        .map_err(failed("store pending offer"))?;
        Ok(())
    }

    fn store_posted_message(&self, message: PostedMessage) -> StoreResult<Message> {
        let conn = self.lock();
        Self::require_contact(&conn, message.contact_id)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages
                 (contact_id, direction, plaintext, ciphertext, nonce, timestamp, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.contact_id,
                Direction::Sent.as_str(),
                message.plaintext,
                message.ciphertext,
                message.nonce,
                encode_time(message.timestamp),
                &message.signature.as_bytes()[..],
            ],
        )
        .map_err(failed("store sent message"))?;

        if inserted > 0 {
            return Self::message_by_id(&conn, conn.last_insert_rowid());
        }
        let raw = conn
            .query_row(
                &format!("{} WHERE signature = ?1", SELECT_MESSAGE),
                params![&message.signature.as_bytes()[..]],
                RawMessage::from_row,
            )
            .map_err(failed("read sent message"))?;
        raw.decode()
    }

    fn store_plaintext(&self, message_id: RecordId, plaintext: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let updated = conn
            .execute(
                "UPDATE messages SET plaintext = ?1 WHERE id = ?2 AND plaintext IS NULL",
                params![plaintext, message_id],
            )
            .map_err(failed("store plaintext"))?;
        if updated > 0 {
            return Ok(true);
        }

        let found = conn
            .query_row("SELECT 1 FROM messages WHERE id = ?1", params![message_id], |_| {
                Ok(())
            })
            .optional()
            .map_err(failed("look up message"))?;
        found
            .map(|()| false)
            .ok_or_else(|| StoreError::NotFound(format!("message {}", message_id)))
    }
}

const SELECT_MESSAGE: &str =
    "SELECT id, contact_id, direction, plaintext, ciphertext, nonce, timestamp, signature
     FROM messages";

struct RawContact {
    id: ContactId,
    name: String,
    verification_key: Vec<u8>,
}

impl RawContact {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            verification_key: row.get(2)?,
        })
    }

    fn decode(self) -> StoreResult<Contact> {
        Ok(Contact {
            id: self.id,
            name: self.name,
            verification_key: PublicKey::from_bytes(&self.verification_key)
                .map_err(corrupt("verification key"))?,
        })
    }
}

struct RawExchangeKey {
    id: RecordId,
    contact_id: ContactId,
    public_key: Vec<u8>,
    initial_key: Option<Vec<u8>>,
    matched: bool,
    received_at: String,
}

impl RawExchangeKey {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            contact_id: row.get(1)?,
            public_key: row.get(2)?,
            initial_key: row.get(3)?,
            matched: row.get(4)?,
            received_at: row.get(5)?,
        })
    }

    fn decode(self) -> StoreResult<ExchangeKeyRecord> {
        Ok(ExchangeKeyRecord {
            id: self.id,
            contact_id: self.contact_id,
            public_key: ExchangePublicKey::from_bytes(&self.public_key)
                .map_err(corrupt("exchange key"))?,
            initial_key: self
                .initial_key
                .map(|k| ExchangePublicKey::from_bytes(&k))
                .transpose()
                .map_err(corrupt("initial key"))?,
            matched: self.matched,
            received_at: decode_time(&self.received_at)?,
        })
    }
}

struct RawMessage {
    id: i64,
    contact_id: ContactId,
    direction: String,
    plaintext: Option<String>,
    ciphertext: String,
    nonce: String,
    timestamp: String,
    signature: Vec<u8>,
}

impl RawMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            contact_id: row.get(1)?,
            direction: row.get(2)?,
            plaintext: row.get(3)?,
            ciphertext: row.get(4)?,
            nonce: row.get(5)?,
            timestamp: row.get(6)?,
            signature: row.get(7)?,
        })
    }

    fn decode(self) -> StoreResult<Message> {
        Ok(Message {
            id: self.id,
            contact_id: self.contact_id,
            direction: Direction::parse(&self.direction).ok_or_else(|| {
                StoreError::DataCorruption(format!("unknown direction {:?}", self.direction))
            })?,
            plaintext: self.plaintext,
            ciphertext: self.ciphertext,
            nonce: self.nonce,
            timestamp: decode_time(&self.timestamp)?,
            signature: SignatureBytes::from_bytes(&self.signature)
                .map_err(corrupt("signature"))?,
        })
    }
}

fn collect<R, T>(
    rows: impl Iterator<Item = rusqlite::Result<R>>,
    context: &'static str,
    decode: impl Fn(R) -> StoreResult<T>,
) -> StoreResult<Vec<T>> {
    rows.map(|row| row.map_err(failed(context)).and_then(&decode))
        .collect()
}

// Fixed-width nanosecond UTC text sorts chronologically
fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(text: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::DataCorruption(format!("timestamp {:?}: {}", text, e)))
}

fn failed(context: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| StoreError::OperationFailed(format!("failed to {}: {}", context, e))
}

fn corrupt<E: std::fmt::Display>(what: &'static str) -> impl Fn(E) -> StoreError {
    move |e| StoreError::DataCorruption(format!("invalid {}: {}", what, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use crate::store::conformance;

    #[test]
    fn test_sqlite_store_conformance() {
        conformance::run_all(|| SqliteStore::new_in_memory().unwrap());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.db");
        let keypair = EphemeralKeypair::generate();
        let verification_key = *Identity::generate().public_key();

        {
            let store = SqliteStore::new(&path).unwrap();
            let bob = store.add_contact("bob", verification_key).unwrap();
            store.store_posted_offer(bob.id, &keypair).unwrap();
        }

        let store = SqliteStore::new(&path).unwrap();
        let contacts = store.contacts().unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].verification_key, verification_key);

        let pending = store.pending_offers().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].keypair.public_key(), keypair.public_key());
    }

    #[test]
    fn test_migration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.db");

        drop(SqliteStore::new(&path).unwrap());
        let store = SqliteStore::new(&path).unwrap();

        let version: i32 = store
            .lock()
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_timestamps_keep_full_precision() {
        let store = SqliteStore::new_in_memory().unwrap();
        let alice = store
            .add_contact("alice", *Identity::generate().public_key())
            .unwrap();
        let derived_at = Utc::now();

        store
            .store_fetch_results(FetchResults {
                offers: vec![crate::model::NewOffer {
                    contact_id: alice.id,
                    public_key: *EphemeralKeypair::generate().public_key(),
                    received_at: derived_at,
                }],
                ..Default::default()
            })
            .unwrap();
        let record = store.unmatched_exchange_keys().unwrap().remove(0);
        assert_eq!(record.received_at, derived_at);
    }
}
