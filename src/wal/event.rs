/// WAL events and their text encoding.
///
/// One event per frame, encoded as `<NAME> <field> <field> ...` with single
/// spaces between fields:
///
/// ```text
/// START_TRANSACTION  <txid>
/// COMMIT_TRANSACTION <txid>
/// CREATE_TABLE       <name>
/// DELETE_TABLE       <name>
/// INSERT_ENTRY       <table> <key> <value>
/// UPDATE_ENTRY       <table> <key> <old> <new>
/// DELETE_ENTRY       <table> <key> <old>
/// FREE_PAGES         <pages>
/// ```
///
/// Transaction ids are 16 hex digits; `<pages>` is a run of 16-hex-digit
/// page ids with no separator (empty when no page was freed). Table names,
/// keys and values are standard base64, so no field ever contains a space.
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{KvError, Result};
use crate::storage::PageId;

pub type TxId = u64;

const HEX_WIDTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StartTransaction {
        txid: TxId,
    },
    CommitTransaction {
        txid: TxId,
    },
    CreateTable {
        name: String,
    },
    DeleteTable {
        name: String,
    },
    InsertEntry {
        table: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    UpdateEntry {
        table: String,
        key: Vec<u8>,
        old_value: Vec<u8>,
        new_value: Vec<u8>,
    },
    DeleteEntry {
        table: String,
        key: Vec<u8>,
        old_value: Vec<u8>,
    },
    FreePages {
        pages: Vec<PageId>,
    },
}

const START_TRANSACTION: &str = "START_TRANSACTION";
const COMMIT_TRANSACTION: &str = "COMMIT_TRANSACTION";
const CREATE_TABLE: &str = "CREATE_TABLE";
const DELETE_TABLE: &str = "DELETE_TABLE";
const INSERT_ENTRY: &str = "INSERT_ENTRY";
const UPDATE_ENTRY: &str = "UPDATE_ENTRY";
const DELETE_ENTRY: &str = "DELETE_ENTRY";
const FREE_PAGES: &str = "FREE_PAGES";

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::StartTransaction { .. } => START_TRANSACTION,
            Event::CommitTransaction { .. } => COMMIT_TRANSACTION,
            Event::CreateTable { .. } => CREATE_TABLE,
            Event::DeleteTable { .. } => DELETE_TABLE,
            Event::InsertEntry { .. } => INSERT_ENTRY,
            Event::UpdateEntry { .. } => UPDATE_ENTRY,
            Event::DeleteEntry { .. } => DELETE_ENTRY,
            Event::FreePages { .. } => FREE_PAGES,
        }
    }

    /// Transaction boundaries and page frees carry no table state.
    pub fn is_bookkeeping(&self) -> bool {
        matches!(
            self,
            Event::StartTransaction { .. }
                | Event::CommitTransaction { .. }
                | Event::FreePages { .. }
        )
    }

    pub fn encode(&self) -> String {
        let fields: Vec<String> = match self {
            Event::StartTransaction { txid } | Event::CommitTransaction { txid } => {
                vec![hex(*txid)]
            }
            Event::CreateTable { name } | Event::DeleteTable { name } => {
                vec![BASE64.encode(name)]
            }
            Event::InsertEntry { table, key, value } => {
                vec![BASE64.encode(table), BASE64.encode(key), BASE64.encode(value)]
            }
            Event::UpdateEntry {
                table,
                key,
                old_value,
                new_value,
            } => vec![
                BASE64.encode(table),
                BASE64.encode(key),
                BASE64.encode(old_value),
                BASE64.encode(new_value),
            ],
            Event::DeleteEntry {
                table,
                key,
                old_value,
            } => vec![
                BASE64.encode(table),
                BASE64.encode(key),
                BASE64.encode(old_value),
            ],
            Event::FreePages { pages } => vec![pages.iter().map(|&p| hex(p)).collect()],
        };
        let mut line = String::from(self.name());
        for field in fields {
            line.push(' ');
            line.push_str(&field);
        }
        line
    }

    pub fn decode(line: &str) -> Result<Self> {
        let mut parts = line.split(' ');
        let name = parts.next().unwrap_or_default();
        let fields: Vec<&str> = parts.collect();

        let expected = match name {
            START_TRANSACTION | COMMIT_TRANSACTION | CREATE_TABLE | DELETE_TABLE
            | FREE_PAGES => 1,
            INSERT_ENTRY | DELETE_ENTRY => 3,
            UPDATE_ENTRY => 4,
            _ => {
                return Err(KvError::WalParse(format!("unknown event name {:?}", name)));
            }
        };
        if fields.len() != expected {
            return Err(KvError::WalParse(format!(
                "{} expects {} fields, got {}",
                name,
                expected,
                fields.len()
            )));
        }

        let event = match name {
            START_TRANSACTION => Event::StartTransaction {
                txid: parse_hex(fields[0])?,
            },
            COMMIT_TRANSACTION => Event::CommitTransaction {
                txid: parse_hex(fields[0])?,
            },
            CREATE_TABLE => Event::CreateTable {
                name: parse_name(fields[0])?,
            },
            DELETE_TABLE => Event::DeleteTable {
                name: parse_name(fields[0])?,
            },
            INSERT_ENTRY => Event::InsertEntry {
                table: parse_name(fields[0])?,
                key: parse_bytes(fields[1])?,
                value: parse_bytes(fields[2])?,
            },
            UPDATE_ENTRY => Event::UpdateEntry {
                table: parse_name(fields[0])?,
                key: parse_bytes(fields[1])?,
                old_value: parse_bytes(fields[2])?,
                new_value: parse_bytes(fields[3])?,
            },
            DELETE_ENTRY => Event::DeleteEntry {
                table: parse_name(fields[0])?,
                key: parse_bytes(fields[1])?,
                old_value: parse_bytes(fields[2])?,
            },
            _ => Event::FreePages {
                pages: parse_page_list(fields[0])?,
            },
        };
        Ok(event)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

fn hex(v: u64) -> String {
    format!("{:016x}", v)
}

fn parse_hex(field: &str) -> Result<u64> {
    if field.len() != HEX_WIDTH {
        return Err(KvError::WalParse(format!(
            "expected {} hex digits, got {:?}",
            HEX_WIDTH, field
        )));
    }
    u64::from_str_radix(field, 16)
        .map_err(|e| KvError::WalParse(format!("bad hex field {:?}: {}", field, e)))
}

fn parse_page_list(field: &str) -> Result<Vec<PageId>> {
    if field.len() % HEX_WIDTH != 0 || !field.is_ascii() {
        return Err(KvError::WalParse(format!(
            "page list length {} is not a multiple of {}",
            field.len(),
            HEX_WIDTH
        )));
    }
    (0..field.len())
        .step_by(HEX_WIDTH)
        .map(|at| parse_hex(&field[at..at + HEX_WIDTH]))
        .collect()
}

fn parse_bytes(field: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(field)
        .map_err(|e| KvError::WalParse(format!("bad base64 field: {}", e)))
}

fn parse_name(field: &str) -> Result<String> {
    String::from_utf8(parse_bytes(field)?)
        .map_err(|_| KvError::WalParse("table name is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_encoding() {
        let event = Event::StartTransaction { txid: 0x2a };
        assert_eq!(event.encode(), "START_TRANSACTION 000000000000002a");

        let event = Event::InsertEntry {
            table: "users".into(),
            key: b"a".to_vec(),
            value: b"1".to_vec(),
        };
        assert_eq!(event.encode(), "INSERT_ENTRY dXNlcnM= YQ== MQ==");

        let event = Event::FreePages { pages: vec![1, 255] };
        assert_eq!(
            event.encode(),
            "FREE_PAGES 000000000000000100000000000000ff"
        );
        assert_eq!(Event::FreePages { pages: vec![] }.encode(), "FREE_PAGES ");
    }

    #[test]
    fn test_event_roundtrip() {
        let events = vec![
            Event::StartTransaction { txid: 1 },
            Event::CreateTable {
                name: "table with spaces".into(),
            },
            Event::InsertEntry {
                table: "t".into(),
                key: vec![0, 32, 255],
                value: vec![],
            },
            Event::UpdateEntry {
                table: "t".into(),
                key: b"k".to_vec(),
                old_value: b"old".to_vec(),
                new_value: b"new".to_vec(),
            },
            Event::DeleteEntry {
                table: "t".into(),
                key: b"k".to_vec(),
                old_value: b"new".to_vec(),
            },
            Event::DeleteTable { name: "t".into() },
            Event::FreePages { pages: vec![] },
            Event::FreePages {
                pages: vec![3, 4, u64::MAX],
            },
            Event::CommitTransaction { txid: u64::MAX },
        ];
        for event in events {
            assert_eq!(Event::decode(&event.encode()).unwrap(), event);
        }
    }

    #[test]
    fn test_decode_rejects_bad_shapes() {
        for line in [
            "",
            "NOPE 00",
            "START_TRANSACTION",
            "START_TRANSACTION 2a",
            "START_TRANSACTION 000000000000002a extra",
            "INSERT_ENTRY dA== YQ==",
            "INSERT_ENTRY dA== YQ== !!!",
            "FREE_PAGES 0001",
            "COMMIT_TRANSACTION 00000000000000zz",
        ] {
            assert!(
                matches!(Event::decode(line), Err(KvError::WalParse(_))),
                "{:?} should not parse",
                line
            );
        }
    }

    #[test]
    fn test_bookkeeping_events() {
        assert!(Event::FreePages { pages: vec![] }.is_bookkeeping());
        assert!(Event::CommitTransaction { txid: 1 }.is_bookkeeping());
        assert!(!Event::CreateTable { name: "t".into() }.is_bookkeeping());
    }
}
