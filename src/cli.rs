//! Administrative commands: each performs one registry operation and exits.

use crate::error::Error;
use crate::registry::StreamRegistry;
use crate::session::StreamUrls;
use std::io::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add(String),
    List,
    Delete(i64),
    Serve,
}

const USAGE: &str = "usage: relay-gateway [serve | add <streamKey> | list | delete <id>]";

impl Command {
    pub fn parse<I>(args: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let command = match args.next().as_deref() {
            None | Some("serve") => Command::Serve,
            Some("add") => Command::Add(
                args.next()
                    .ok_or_else(|| Error::InvalidInput(USAGE.to_string()))?,
            ),
            Some("list") => Command::List,
            Some("delete") => {
                let id = args
                    .next()
                    .ok_or_else(|| Error::InvalidInput(USAGE.to_string()))?;
                Command::Delete(id.parse().map_err(|_| {
                    Error::InvalidInput(format!("Stream id must be a number: {:?}", id))
                })?)
            }
            Some(other) => {
                return Err(Error::InvalidInput(format!(
                    "Unknown command {:?}\n{}",
                    other, USAGE
                )))
            }
        };

        Ok(command)
    }
}

/// Run an administrative command, printing its result to `out`
pub async fn run_command<W: Write>(
    command: Command,
    registry: &StreamRegistry,
    urls: &StreamUrls,
    out: &mut W,
) -> anyhow::Result<()> {
    match command {
        Command::Add(stream_key) => {
            let record = registry.register(&stream_key).await?;
            writeln!(out, "Added: {}", record.stream_key)?;
            writeln!(out, "RTMP URL: {}", urls.ingest_url(&record)?)?;
            writeln!(out, "Stream key: {}", record.stream_key)?;
            writeln!(out, "HTTP URL: {}", urls.play_url(&record)?)?;
        }
        Command::List => {
            for record in registry.list().await? {
                writeln!(
                    out,
                    "{} {} {} {} {}",
                    record.id,
                    record.stream_key,
                    record.routing_hash,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    urls.play_url(&record)?
                )?;
            }
        }
        Command::Delete(id) => {
            registry.delete(id).await?;
            writeln!(out, "Deleted stream {}", id)?;
        }
        Command::Serve => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngestConfig, PackagingConfig};
    use crate::db::DatabaseService;
    use crate::registry::derive_routing_hash;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse(args(&[])).unwrap(), Command::Serve);
        assert_eq!(
            Command::parse(args(&["add", "k1"])).unwrap(),
            Command::Add("k1".to_string())
        );
        assert_eq!(Command::parse(args(&["list"])).unwrap(), Command::List);
        assert_eq!(Command::parse(args(&["delete", "7"])).unwrap(), Command::Delete(7));

        assert!(Command::parse(args(&["add"])).is_err());
        assert!(Command::parse(args(&["delete", "seven"])).is_err());
        assert!(Command::parse(args(&["frobnicate"])).is_err());
    }

    #[tokio::test]
    async fn add_list_delete_round() {
        let db = DatabaseService::in_memory().await.unwrap();
        let registry = StreamRegistry::new(db.pool.clone());
        let urls = StreamUrls::new(&IngestConfig::default(), &PackagingConfig::default()).unwrap();

        let mut out = Vec::new();
        run_command(Command::Add("studio-a".into()), &registry, &urls, &mut out)
            .await
            .unwrap();
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("RTMP URL: rtmp://localhost:1935/live"));
        assert!(printed.contains(".flv"));

        let mut out = Vec::new();
        run_command(Command::List, &registry, &urls, &mut out).await.unwrap();
        let listed = String::from_utf8(out).unwrap();
        assert_eq!(listed.lines().count(), 1);
        let fields: Vec<&str> = listed.split_whitespace().collect();
        assert_eq!(fields[0], "1");
        assert_eq!(fields[1], "studio-a");
        assert_eq!(fields[2], derive_routing_hash("studio-a"));

        let mut out = Vec::new();
        run_command(Command::Delete(1), &registry, &urls, &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap().trim(), "Deleted stream 1");

        let err = run_command(Command::Delete(1), &registry, &urls, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_))));
    }
}
