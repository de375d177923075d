//! Send command

use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use crawlsink::{
  record::{CRAWL_ID_FIELD, Fields, VISIT_ID_FIELD},
  transport::RecordClient,
};

/// Send one structured record, tagged with its crawl and visit
pub async fn cmd_send(addr: SocketAddr, crawl_id: i64, visit_id: i64, table: &str, data: Option<&str>) -> Result<()> {
  let mut fields = match data {
    Some(json) => match serde_json::from_str::<serde_json::Value>(json).context("Invalid JSON")? {
      serde_json::Value::Object(fields) => fields,
      other => bail!("Record data must be a JSON object, got {}", other),
    },
    None => Fields::new(),
  };
  fields.insert(CRAWL_ID_FIELD.to_string(), crawl_id.into());
  fields.insert(VISIT_ID_FIELD.to_string(), visit_id.into());

  let mut client = RecordClient::connect(addr)
    .await
    .with_context(|| format!("Failed to connect to listener at {}", addr))?;
  client.send_record(table, fields).await.context("Failed to send record")?;
  client.close().await?;

  println!("Sent record for visit {} to {}", visit_id, addr);
  Ok(())
}
