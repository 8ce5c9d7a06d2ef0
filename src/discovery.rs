//! Finding the message row key.
//!
//! The web client never hands out the algorithm and key it uses for message
//! rows. Instead we watch the decrypt operations it performs, replay each
//! one against a known chat row with that row's IV, and accept the first
//! whose output decodes as a message row.

use std::io::{self, BufRead, Lines};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use base64::prelude::*;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cipher::{DecryptionContext, RowAlgorithm, RowKey};
use crate::error::{DiscoveryError, ProbeError};
use crate::protobuf::decode_message_row;
use crate::record::{base64_bytes, OpaqueData};

/// One decrypt operation the host performed, minus its IV and data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedDecrypt {
    pub algorithm: RowAlgorithm,
    pub key: RowKey,
}

/// Interception point on the host's decrypt primitive.
///
/// Implementations only report what the host did; the host's own operation
/// must go ahead exactly as it would without the observer.
pub trait DecryptObserver {
    fn install(&mut self) -> Result<(), DiscoveryError>;

    /// Blocks until the host performs its next decrypt. `None` means no more
    /// operations will be observed.
    fn next_decrypt(&mut self) -> Result<Option<ObservedDecrypt>, DiscoveryError>;

    /// Puts the original primitive back.
    fn restore(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Unknown,
    Probing,
    Discovered,
}

const INTERCEPTOR_IDLE: u8 = 0;
const INTERCEPTOR_INSTALLED: u8 = 1;
const INTERCEPTOR_RESTORED: u8 = 2;

/// Holds the discovered context. Set at most once; read-only afterwards.
#[derive(Debug, Default)]
pub struct ContextCell {
    context: OnceLock<DecryptionContext>,
    interceptor: AtomicU8,
}

impl ContextCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cell.
    pub fn global() -> &'static ContextCell {
        static GLOBAL: OnceLock<ContextCell> = OnceLock::new();
        GLOBAL.get_or_init(ContextCell::new)
    }

    pub fn get(&self) -> Option<&DecryptionContext> {
        self.context.get()
    }

    /// Stores `context` unless one is already stored. Returns whether this
    /// call won.
    pub fn offer(&self, context: DecryptionContext) -> bool {
        self.context.set(context).is_ok()
    }

    pub fn state(&self) -> DiscoveryState {
        if self.context.get().is_some() {
            DiscoveryState::Discovered
        } else if self.interceptor.load(Ordering::Acquire) == INTERCEPTOR_INSTALLED {
            DiscoveryState::Probing
        } else {
            DiscoveryState::Unknown
        }
    }
}

/// Replays one observed operation against the test row.
pub fn probe(observed: &ObservedDecrypt, test: &OpaqueData) -> Result<DecryptionContext, ProbeError> {
    let plaintext = observed
        .algorithm
        .decrypt(&observed.key, &test.iv, &test.data)?;
    decode_message_row(&plaintext)?;
    Ok(DecryptionContext::new(
        observed.algorithm,
        observed.key.clone(),
    ))
}

/// Runs discovery against `observer`, or returns the context found earlier.
///
/// The interceptor is installed at most once per cell and is restored as
/// soon as probing ends, successfully or not.
pub fn discover<'c>(
    cell: &'c ContextCell,
    observer: &mut dyn DecryptObserver,
    test: &OpaqueData,
) -> Result<&'c DecryptionContext, DiscoveryError> {
    if let Some(context) = cell.get() {
        info!("reusing previously stored decryption arguments");
        return Ok(context);
    }

    cell.interceptor
        .compare_exchange(
            INTERCEPTOR_IDLE,
            INTERCEPTOR_INSTALLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map_err(|_| DiscoveryError::InterceptorSpent)?;
    if let Err(e) = observer.install() {
        cell.interceptor.store(INTERCEPTOR_IDLE, Ordering::Release);
        return Err(e);
    }
    info!("no decrypt args found, waiting for them (open a few chats!)");

    let outcome = watch(cell, observer, test);

    observer.restore();
    cell.interceptor
        .store(INTERCEPTOR_RESTORED, Ordering::Release);
    outcome?;

    cell.get().ok_or(DiscoveryError::ObserverExhausted)
}

fn watch(
    cell: &ContextCell,
    observer: &mut dyn DecryptObserver,
    test: &OpaqueData,
) -> Result<(), DiscoveryError> {
    let mut attempts = 0usize;
    while let Some(observed) = observer.next_decrypt()? {
        if cell.get().is_some() {
            return Ok(());
        }
        attempts += 1;
        match probe(&observed, test) {
            Ok(context) => {
                if cell.offer(context) {
                    info!(algorithm = %observed.algorithm, attempts, "decrypt args found");
                }
                return Ok(());
            }
            Err(e) => debug!(algorithm = %observed.algorithm, error = %e, "could not decode test data"),
        }
    }
    Err(DiscoveryError::ObserverExhausted)
}

#[derive(Deserialize)]
struct ObservationLine {
    algorithm: RowAlgorithm,
    #[serde(with = "base64_bytes")]
    key: Vec<u8>,
}

/// Observer fed from a recording of the host's decrypt calls, one JSON
/// object per line: `{"algorithm": {"name": "AES-CBC"}, "key": "<base64>"}`.
/// When the recording runs out it can fall back to asking for a key on the
/// terminal, which is tried as AES-CBC.
pub struct ReplayObserver<R> {
    lines: Lines<R>,
    line_no: usize,
    interactive: bool,
    installed: bool,
}

impl<R: BufRead> ReplayObserver<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
            interactive: false,
            installed: false,
        }
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    fn next_recorded(&mut self) -> Result<Option<ObservedDecrypt>, DiscoveryError> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let line = line.map_err(|e| DiscoveryError::Observer(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: ObservationLine = serde_json::from_str(&line)
                .map_err(|e| DiscoveryError::Observer(format!("line {}: {e}", self.line_no)))?;
            return Ok(Some(ObservedDecrypt {
                algorithm: parsed.algorithm,
                key: RowKey::new(parsed.key),
            }));
        }
        Ok(None)
    }

    fn prompt(&self) -> Result<Option<ObservedDecrypt>, DiscoveryError> {
        loop {
            let answer = rpassword::prompt_password("Row key (hex or base64, empty to give up): ")
                .map_err(|e| DiscoveryError::Observer(e.to_string()))?;
            let answer = answer.trim();
            if answer.is_empty() {
                return Ok(None);
            }
            match parse_key(answer) {
                Some(key) => {
                    return Ok(Some(ObservedDecrypt {
                        algorithm: RowAlgorithm::AesCbc,
                        key: RowKey::new(key),
                    }))
                }
                None => warn!("could not parse key, expected hex or base64"),
            }
        }
    }
}

impl ReplayObserver<io::Empty> {
    /// Observer that only asks on the terminal.
    pub fn prompt_only() -> Self {
        ReplayObserver::new(io::empty()).interactive(true)
    }
}

impl<R: BufRead> DecryptObserver for ReplayObserver<R> {
    fn install(&mut self) -> Result<(), DiscoveryError> {
        self.installed = true;
        Ok(())
    }

    fn next_decrypt(&mut self) -> Result<Option<ObservedDecrypt>, DiscoveryError> {
        if !self.installed {
            return Err(DiscoveryError::Observer("observer is not installed".into()));
        }
        match self.next_recorded()? {
            Some(observed) => Ok(Some(observed)),
            None if self.interactive => self.prompt(),
            None => Ok(None),
        }
    }

    fn restore(&mut self) {
        self.installed = false;
    }
}

fn parse_key(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 == 0 && text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return hex::decode(text).ok();
    }
    BASE64_STANDARD.decode(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::test_support::cbc_encrypt_256;
    use crate::error::DecodeError;
    use std::io::Cursor;

    const KEY: [u8; 32] = [0x11; 32];
    const IV: [u8; 16] = [0x22; 16];

    // {currentMsg: {body: "hi"}}
    const ROW: [u8; 6] = [0x0a, 0x04, 0x0a, 0x02, b'h', b'i'];

    fn test_row() -> OpaqueData {
        OpaqueData {
            iv: IV.to_vec(),
            data: cbc_encrypt_256(&KEY, &IV, &ROW),
        }
    }

    fn right() -> ObservedDecrypt {
        ObservedDecrypt {
            algorithm: RowAlgorithm::AesCbc,
            key: RowKey::new(KEY.to_vec()),
        }
    }

    fn wrong() -> Vec<ObservedDecrypt> {
        vec![
            ObservedDecrypt {
                algorithm: RowAlgorithm::AesCbc,
                key: RowKey::new(vec![0u8; 24]),
            },
            ObservedDecrypt {
                algorithm: RowAlgorithm::AesGcm { tag_bits: 128 },
                key: RowKey::new(KEY.to_vec()),
            },
        ]
    }

    #[derive(Default)]
    struct ScriptedObserver {
        script: Vec<ObservedDecrypt>,
        installs: usize,
        restores: usize,
        served: usize,
    }

    impl ScriptedObserver {
        fn new(script: Vec<ObservedDecrypt>) -> Self {
            Self {
                script,
                ..Default::default()
            }
        }
    }

    impl DecryptObserver for ScriptedObserver {
        fn install(&mut self) -> Result<(), DiscoveryError> {
            self.installs += 1;
            Ok(())
        }

        fn next_decrypt(&mut self) -> Result<Option<ObservedDecrypt>, DiscoveryError> {
            let next = self.script.get(self.served).cloned();
            self.served += 1;
            Ok(next)
        }

        fn restore(&mut self) {
            self.restores += 1;
        }
    }

    #[test]
    fn probe_accepts_the_right_key() {
        let context = probe(&right(), &test_row()).unwrap();
        assert_eq!(context.algorithm, RowAlgorithm::AesCbc);
        assert_eq!(context.key.as_bytes(), &KEY);
    }

    #[test]
    fn probe_rejects_output_that_does_not_decode() {
        let key = RowKey::new(vec![5u8; 16]);
        let algorithm = RowAlgorithm::AesCtr { counter_bits: 128 };
        // CTR is its own inverse, so this is the ciphertext of [0, 1]
        let data = algorithm.decrypt(&key, &[0u8; 16], &[0x00, 0x01]).unwrap();
        let test = OpaqueData {
            iv: vec![0u8; 16],
            data,
        };
        assert_eq!(
            probe(&ObservedDecrypt { algorithm, key }, &test),
            Err(ProbeError::Decode(DecodeError::UnknownField(0)))
        );
    }

    #[test]
    fn skips_failed_probes_until_one_decodes() {
        let cell = ContextCell::new();
        assert_eq!(cell.state(), DiscoveryState::Unknown);
        let mut script = wrong();
        script.push(right());
        script.push(ObservedDecrypt {
            algorithm: RowAlgorithm::AesCtr { counter_bits: 64 },
            key: RowKey::new(vec![9u8; 16]),
        });
        let mut observer = ScriptedObserver::new(script);

        let context = discover(&cell, &mut observer, &test_row()).unwrap();
        assert_eq!(context.key.as_bytes(), &KEY);
        assert_eq!(observer.served, 3);
        assert_eq!(observer.installs, 1);
        assert_eq!(observer.restores, 1);
        assert_eq!(cell.state(), DiscoveryState::Discovered);
    }

    #[test]
    fn discovered_context_short_circuits() {
        let cell = ContextCell::new();
        let mut first = ScriptedObserver::new(vec![right()]);
        discover(&cell, &mut first, &test_row()).unwrap();

        let mut second = ScriptedObserver::new(wrong());
        let context = discover(&cell, &mut second, &test_row()).unwrap();
        assert_eq!(context.key.as_bytes(), &KEY);
        assert_eq!(second.installs, 0);
        assert_eq!(second.served, 0);
        assert_eq!(first.installs, 1);
    }

    #[test]
    fn exhausted_observer_is_restored_and_cannot_be_reinstalled() {
        let cell = ContextCell::new();
        let mut observer = ScriptedObserver::new(wrong());
        assert!(matches!(
            discover(&cell, &mut observer, &test_row()),
            Err(DiscoveryError::ObserverExhausted)
        ));
        assert_eq!(observer.restores, 1);
        assert_eq!(cell.state(), DiscoveryState::Unknown);

        let mut again = ScriptedObserver::new(vec![right()]);
        assert!(matches!(
            discover(&cell, &mut again, &test_row()),
            Err(DiscoveryError::InterceptorSpent)
        ));
        assert_eq!(again.installs, 0);
    }

    #[test]
    fn first_writer_wins() {
        let cell = ContextCell::new();
        let a = DecryptionContext::new(RowAlgorithm::AesCbc, RowKey::new(vec![1u8; 32]));
        let b = DecryptionContext::new(RowAlgorithm::AesCbc, RowKey::new(vec![2u8; 32]));
        assert!(cell.offer(a.clone()));
        assert!(!cell.offer(b));
        assert_eq!(cell.get(), Some(&a));
    }

    #[test]
    fn replay_observer_reads_json_lines() {
        let recording = format!(
            "{}\n\n{}\n",
            r#"{"algorithm":{"name":"AES-GCM","tagLength":128},"key":"AAAAAAAAAAAAAAAAAAAAAA=="}"#,
            format!(
                r#"{{"algorithm":{{"name":"AES-CBC","iv":"ignored"}},"key":"{}"}}"#,
                BASE64_STANDARD.encode(KEY)
            ),
        );
        let mut observer = ReplayObserver::new(Cursor::new(recording));
        let cell = ContextCell::new();

        let context = discover(&cell, &mut observer, &test_row()).unwrap();
        assert_eq!(context.algorithm, RowAlgorithm::AesCbc);
        assert_eq!(context.key.as_bytes(), &KEY);
    }

    #[test]
    fn replay_observer_reports_bad_lines() {
        let mut observer = ReplayObserver::new(Cursor::new("not json\n"));
        observer.install().unwrap();
        assert!(matches!(
            observer.next_decrypt(),
            Err(DiscoveryError::Observer(msg)) if msg.starts_with("line 1")
        ));
    }

    #[test]
    fn keys_parse_as_hex_or_base64() {
        assert_eq!(parse_key("00ff"), Some(vec![0x00, 0xff]));
        assert_eq!(parse_key("AP8="), Some(vec![0x00, 0xff]));
        assert_eq!(parse_key("!!"), None);
    }
}
