//! Subcommand implementations

use anyhow::{Context, Result};
use serde_json::{Map, Value as Json, json};
use strata_common::{EngineConfig, Error, ObjectId, RowLocator};
use strata_engine::{Engine, IndexKind, InsertTicket, Row, TableSchema};
use strata_storage::{IndexKey, JournalReader, JournalRecord, JournalVerifier, Value};
use tracing::{info, warn};

const DEMO_TABLE: &str = "demo_users";
const DEMO_CITIES: [&str; 3] = ["lisbon", "oslo", "quito"];

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn row_json(row: &Row) -> Result<Json> {
    let mut values = Map::new();
    for (column, value) in &row.values {
        values.insert(column.clone(), serde_json::to_value(value)?);
    }
    Ok(json!({
        "row_id": row.locator.row_id.to_string(),
        "page": row.locator.data_page.to_string(),
        "values": values,
    }))
}

async fn open(config: EngineConfig) -> Result<Engine> {
    let dir = config.storage.data_dir.clone();
    Engine::open(config)
        .await
        .with_context(|| format!("failed to open engine at {}", dir.display()))
}

pub async fn recover(config: EngineConfig) -> Result<()> {
    let engine = open(config).await?;
    print_json(engine.recovery_report())?;
    engine.shutdown()?;
    Ok(())
}

pub async fn stats(config: EngineConfig) -> Result<()> {
    let engine = open(config).await?;
    print_json(&engine.stats()?)?;
    engine.shutdown()?;
    Ok(())
}

pub async fn scan(config: EngineConfig, table: &str) -> Result<()> {
    let engine = open(config).await?;
    let rows = engine
        .scan(table)
        .await?
        .iter()
        .map(row_json)
        .collect::<Result<Vec<_>>>()?;
    print_json(&rows)?;
    engine.shutdown()?;
    Ok(())
}

fn record_json(record: &JournalRecord, dump: bool) -> Json {
    let mut out = json!({
        "sequence": record.sequence(),
        "kind": format!("{:?}", record.kind()),
        "related": record.related(),
    });
    let detail = match record {
        JournalRecord::Insert { table, values, .. } => json!({
            "table": table,
            "columns": values.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>(),
        }),
        JournalRecord::InsertSlots { locator, .. } => json!({
            "row_id": locator.row_id.to_string(),
            "page": locator.data_page.to_string(),
        }),
        JournalRecord::WritePage { offset, data, .. } if dump => json!({
            "offset": offset,
            "bytes": data.len(),
            "data": hex::encode(data),
        }),
        JournalRecord::WritePage { offset, data, .. } => json!({
            "offset": offset,
            "bytes": data.len(),
        }),
        JournalRecord::UpdateUniqueIndex { column, .. }
        | JournalRecord::UpdateUniqueIndexCheckpoint { column, .. }
        | JournalRecord::UpdateMultiIndex { column, .. }
        | JournalRecord::UpdateMultiIndexCheckpoint { column, .. } => json!({ "column": column }),
        _ => Json::Null,
    };
    if !detail.is_null() {
        out["detail"] = detail;
    }
    out
}

/// Read the journal in place; the engine is not opened so nothing is replayed
pub fn inspect_journal(config: &EngineConfig, dump: bool) -> Result<()> {
    let path = config.journal_path();
    let mut reader = JournalReader::open(&path)?;
    let mut verifier = JournalVerifier::new();
    let mut records = Vec::new();
    let mut error = None;

    for record in reader.by_ref() {
        match record {
            Ok(record) => {
                records.push(record_json(&record, dump));
                verifier.observe(record);
            }
            Err(e) => {
                warn!(position = records.len(), "Journal scan stopped: {}", e);
                error = Some(e.to_string());
                break;
            }
        }
    }

    let incomplete: Vec<Json> = verifier
        .finish()
        .iter()
        .map(|group| {
            json!({
                "root": group.root,
                "table": match group.root_record() {
                    Some(JournalRecord::Insert { table, .. }) => Some(table.as_str()),
                    _ => None,
                },
                "records": group.records.iter().map(|r| r.sequence()).collect::<Vec<_>>(),
            })
        })
        .collect();

    print_json(&json!({
        "path": path.display().to_string(),
        "bytes_read": reader.position(),
        "truncated_at": reader.truncated_at(),
        "error": error,
        "records": records,
        "incomplete": incomplete,
    }))
}

fn demo_ticket(n: usize) -> InsertTicket {
    InsertTicket::new(DEMO_TABLE)
        .with("email", format!("user{n}@strata.local"))
        .with("handle", ObjectId::new())
        .with("city", DEMO_CITIES[n % DEMO_CITIES.len()])
        .with("visits", n as i64)
}

pub async fn demo(config: EngineConfig, rows: usize) -> Result<()> {
    let engine = open(config).await?;

    let table = match engine.table(DEMO_TABLE) {
        Ok(table) => table,
        Err(Error::TableNotFound(_)) => engine.create_table(
            TableSchema::new(DEMO_TABLE)
                .required_column("email", IndexKind::Unique)
                .column("handle", IndexKind::Unique)
                .column("city", IndexKind::Multi)
                .column("visits", IndexKind::None),
        )?,
        Err(e) => return Err(e.into()),
    };
    let start = table.row_index().len() as usize;
    info!(table = DEMO_TABLE, existing = start, rows, "Running demo");

    let mut inserted: Vec<RowLocator> = Vec::with_capacity(rows);
    for n in start..start + rows {
        inserted.push(engine.insert(demo_ticket(n)).await?);
    }

    // a repeated email must be rejected and leave no row behind
    let duplicate = match engine.insert(demo_ticket(start)).await {
        Err(Error::DuplicateKey { .. }) => true,
        Err(e) => return Err(e.into()),
        Ok(locator) => anyhow::bail!("duplicate email accepted at {locator}"),
    };

    let mut by_city = Map::new();
    for city in DEMO_CITIES {
        let hits = engine.lookup(DEMO_TABLE, "city", Value::from(city)).await?;
        by_city.insert(city.to_string(), json!(hits.len()));
    }

    let txn = engine.begin_transaction();
    let txn_locator = engine
        .transactions()
        .insert(&txn, demo_ticket(start + rows))
        .await?;
    // the transaction sees its own write before commit
    let own_write = engine
        .transactions()
        .get(
            &txn,
            DEMO_TABLE,
            "email",
            &IndexKey::single(Value::from(format!("user{}@strata.local", start + rows))),
        )
        .await?;
    engine.commit(&txn).await?;
    let committed = engine.read_row(txn_locator)?;

    let first = match inserted.first() {
        Some(locator) => Some(row_json(&engine.read_row(*locator)?)?),
        None => None,
    };

    print_json(&json!({
        "table": DEMO_TABLE,
        "inserted": inserted.len(),
        "duplicate_rejected": duplicate,
        "first_row": first,
        "rows_by_city": by_city,
        "transaction": {
            "id": txn.id().to_string(),
            "own_write_visible": own_write == vec![txn_locator],
            "committed_row": row_json(&committed)?,
        },
        "total_rows": engine.table(DEMO_TABLE)?.row_index().len(),
    }))?;

    engine.shutdown()?;
    Ok(())
}
