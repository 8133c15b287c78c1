use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use sporc::source::{RemoteClient, EPISODE_FILE, TURN_FILE};
use sporc::{CorpusSource, Dataset, DatasetOptions, IndexPolicy, Mode, SporcError, TurnOffsetIndex};

const TOKEN: &str = "secret";

/// Serve `files` over plain HTTP on a loopback port, one request per
/// connection. Requests without the bearer token get a 401.
fn serve(files: HashMap<&'static str, String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let files = Arc::new(files);

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let Ok(read_half) = stream.try_clone() else { continue };
            let mut reader = BufReader::new(read_half);
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).is_err() {
                continue;
            }
            let mut authorized = false;
            loop {
                let mut header = String::new();
                match reader.read_line(&mut header) {
                    Ok(0) | Err(_) => break,
                    Ok(_) if header == "\r\n" => break,
                    Ok(_) => {}
                }
                if header.to_ascii_lowercase().starts_with("authorization:") && header.contains(TOKEN) {
                    authorized = true;
                }
            }

            let path = request_line.split_whitespace().nth(1).unwrap_or("/");
            let (status, body) = match files.get(path.trim_start_matches('/')) {
                _ if !authorized => ("401 Unauthorized", String::new()),
                Some(body) => ("200 OK", body.clone()),
                None => ("404 Not Found", String::new()),
            };
            let _ = write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: application/x-ndjson\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
        }
    });
    format!("http://{addr}")
}

fn files() -> HashMap<&'static str, String> {
    let episodes = [
        r#"{"podTitle": "Alpha Radio", "mp3url": "a1", "epTitle": "First", "durationSeconds": 60, "language": "en"}"#,
        r#"{"podTitle": "Alpha Radio", "mp3url": "a2", "epTitle": "Second", "durationSeconds": 90, "language": "en"}"#,
    ];
    let turns = [
        r#"{"mp3url": "a1", "speaker": ["SPEAKER_00"], "turnText": "hello", "startTime": 0, "endTime": 5}"#,
        r#"{"mp3url": "a2", "speaker": ["SPEAKER_00"], "turnText": "other", "startTime": 0, "endTime": 5}"#,
        r#"{"mp3url": "a1", "speaker": ["SPEAKER_01"], "turnText": "hi there", "startTime": 5, "endTime": 9}"#,
    ];
    HashMap::from([
        (EPISODE_FILE, episodes.join("\n") + "\n"),
        (TURN_FILE, turns.join("\n") + "\n"),
    ])
}

fn client(base_url: &str, token: Option<&str>) -> RemoteClient {
    // Loopback traffic must not go through an HTTP proxy from the environment.
    let http = reqwest::blocking::Client::builder().no_proxy().build().unwrap();
    RemoteClient::with_client(base_url, token.map(str::to_string), http)
}

#[test]
fn remote_source_loads_turns_by_full_scan() {
    let base = serve(files());
    let source = CorpusSource::remote(client(&base, Some(TOKEN)), false);
    assert!(!source.is_seekable());

    let ds = Dataset::open(
        source,
        DatasetOptions {
            index_policy: IndexPolicy::Eager,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(ds.mode(), Mode::Memory);
    assert_eq!(ds.len().unwrap(), 2);

    let a1 = ds.episode("a1").unwrap();
    let turns = ds.load_turns_for(&a1).unwrap();
    let texts: Vec<&str> = turns.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(texts, vec!["hello", "hi there"]);

    let status = ds.index_status();
    assert!(!status.index_built);
    assert!(!status.local_mode);
    assert_eq!(status.build_state, None);
}

#[test]
fn remote_source_rejects_a_missing_token() {
    let base = serve(files());
    let source = CorpusSource::remote(client(&base, None), false);
    assert!(matches!(
        Dataset::open(source, DatasetOptions::default()),
        Err(SporcError::DatasetAccess(_))
    ));
}

#[test]
fn offset_index_is_unavailable_for_remote_sources() {
    // Nothing listens here; every call below must fail before any request.
    let source = CorpusSource::remote(client("http://127.0.0.1:9", None), false);

    assert!(matches!(
        TurnOffsetIndex::build(&source),
        Err(SporcError::IndexUnavailable(_))
    ));
    assert!(matches!(
        TurnOffsetIndex::build_async(&source, None),
        Err(SporcError::IndexUnavailable(_))
    ));

    let ds = Dataset::open(
        source,
        DatasetOptions {
            streaming: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(matches!(ds.build_index(false), Err(SporcError::IndexUnavailable(_))));
    assert!(matches!(ds.build_index_async(), Err(SporcError::IndexUnavailable(_))));
    assert!(ds.wait_for_index().unwrap().is_none());
}
