//! Line-oriented terminal editor: each stdin line is appended to the
//! document; lines starting with `:` are commands.

use log::warn;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use civic_collab::config::CollabConfig;
use civic_collab::failover::{preflight_restricted, NetworkTransports};
use civic_collab::ids::{IdSource, RandomIds};
use civic_collab::protocol::PeerInfo;
use civic_collab::reconciler::{Surface, TextSurface};
use civic_collab::rewrite::{HttpRewriter, RewriteService, StyleTag, REWRITE_COMMAND};
use civic_collab::session::{Session, SessionConfig, SessionStatus};
use civic_collab::storage::{CacheConfig, LocalCache, MemoryCache, TextCache};
use civic_collab::transport::{MeshConfig, RelayConfig};

const HELP: &str = "\
:show     print the document
:status   connection and collaborators
:dismiss  clear the warning
:undo     delete the last line
:quit     leave the room
Any other line is appended. A line with /rewrite is restyled.";

pub async fn run(
    config: CollabConfig,
    room: Option<String>,
    style: StyleTag,
    name: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut ids = RandomIds::new();
    let peer = PeerInfo::new(
        ids.replica_id(),
        name.unwrap_or_else(|| ids.display_name()),
        ids.color(),
    );

    let restricted = preflight_restricted(config.force_relay, Some(config.cache_path.as_path()));
    let cache = open_cache(&config, restricted);
    let rewriter = rewriter(&config);
    let session_config = SessionConfig::new(style, &config, restricted);

    let mut session = match room {
        None => {
            println!("Editing solo ({style}). Type :help for commands.");
            Session::solo(TextSurface::new(""), peer, cache, rewriter, session_config)
        }
        Some(room_id) => {
            let room = config.room(&room_id)?;
            let transports = NetworkTransports {
                peer: peer.clone(),
                channel: room.channel.clone(),
                mesh: MeshConfig {
                    listen_addr: config.mesh_listen_addr.clone(),
                    max_peers: config.max_peers_or(&mut ids),
                    ..MeshConfig::new(room.signaling_endpoints.clone())
                },
                relay: RelayConfig::new(room.fallback_endpoint.clone()),
            };
            println!("Joined {} as {}. Type :help for commands.", room.room_id, peer.name);
            Session::collaborative(
                TextSurface::new(""),
                peer,
                cache,
                rewriter,
                Box::new(transports),
                session_config,
            )?
        }
    };
    if !session.text().is_empty() {
        print_document(&session.text());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shown = session.text();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_line(&mut session, &line) {
                    break;
                }
                shown = session.text();
            }
            _ = session.step() => {
                let text = session.text();
                if text != shown {
                    print_document(&text);
                    shown = text;
                }
            }
        }
    }

    let surface = session.shutdown();
    println!("Left with {} chars.", surface.text().chars().count());
    Ok(())
}

/// Returns false to quit.
fn handle_line(session: &mut Session<TextSurface>, line: &str) -> bool {
    match line.trim() {
        ":quit" | ":q" => return false,
        ":help" => println!("{HELP}"),
        ":show" => print_document(&session.text()),
        ":status" => print_status(&session.status()),
        ":dismiss" => session.dismiss_warning(),
        ":undo" => session.edit(|surface| {
            let text = surface.text();
            let trimmed = text.strip_suffix('\n').unwrap_or(&text);
            let keep = trimmed.rfind('\n').map_or(0, |i| i + 1);
            let keep_chars = text[..keep].chars().count();
            let len = text.chars().count() - keep_chars;
            surface.delete(keep_chars, len);
        }),
        _ => {
            session.edit(|surface| surface.append(&format!("{line}\n")));
            if line.contains(REWRITE_COMMAND) && !session.request_rewrite() {
                println!("(nothing to rewrite)");
            }
        }
    }
    true
}

fn open_cache(config: &CollabConfig, restricted: bool) -> Box<dyn TextCache> {
    // A forced relay says nothing about the disk.
    if restricted && !config.force_relay {
        warn!("Cache directory unusable, keeping the draft in memory only");
        return Box::new(MemoryCache::new());
    }
    match LocalCache::open(CacheConfig::new(&config.cache_path)) {
        Ok(cache) => Box::new(cache),
        Err(e) => {
            warn!("Cache unavailable, keeping the draft in memory only: {e}");
            Box::new(MemoryCache::new())
        }
    }
}

/// Always the HTTP service: a missing endpoint or key surfaces as a
/// warning on the first rewrite, with the built-in rewrite applied.
fn rewriter(config: &CollabConfig) -> Arc<dyn RewriteService> {
    let http = HttpRewriter::new(config.rewrite_endpoint.clone(), config.rewrite_api_key.clone());
    if !http.is_configured() {
        warn!("Rewrite service not configured; /rewrite will use the built-in rewrite");
    }
    Arc::new(http)
}

fn print_document(text: &str) {
    println!("──── document ────");
    println!("{}", text.trim_end_matches('\n'));
    println!("──────────────────");
}

fn print_status(status: &SessionStatus) {
    match (status.connection, status.transport) {
        (Some(connection), Some(kind)) => println!("{kind}: {connection:?}"),
        (Some(connection), None) => println!("{connection:?}"),
        _ => println!("solo"),
    }
    if !status.collaborators.is_empty() {
        println!("with: {}", status.collaborators.join(", "));
    }
    if status.someone_typing {
        println!("someone is typing...");
    }
    if let Some(warning) = &status.warning {
        println!("warning: {warning} (:dismiss)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civic_collab::rewrite::RewriteError;

    #[tokio::test]
    async fn test_missing_api_key_reaches_the_session() {
        let config = CollabConfig {
            rewrite_endpoint: Some("http://127.0.0.1:1/rewrite".into()),
            rewrite_api_key: None,
            ..CollabConfig::default()
        };
        let err = rewriter(&config).rewrite("fine", StyleTag::Happy).await.unwrap_err();
        assert!(matches!(err, RewriteError::NotConfigured("API key")));
    }

    #[test]
    fn test_undo_removes_last_line() {
        let mut session = Session::solo(
            TextSurface::new(""),
            PeerInfo::with_id(1, "Solo"),
            Box::new(MemoryCache::new()),
            rewriter(&CollabConfig::default()),
            SessionConfig::default(),
        );
        assert!(handle_line(&mut session, "first"));
        assert!(handle_line(&mut session, "second"));
        assert!(handle_line(&mut session, ":undo"));
        assert_eq!(session.text(), "first\n");
        assert!(!handle_line(&mut session, ":q"));
    }
}
