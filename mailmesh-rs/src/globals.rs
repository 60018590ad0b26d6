//! Process-wide directives
//!
//! [`read_globals`] extracts the fixed set of global directives from the
//! top-level configuration and passes every other node through, in order,
//! to the module graph builder.

use crate::config::{self, ConfigNode, DirectiveMap};
use crate::dirs;
use crate::error::Result;
use crate::log::{LogHandle, LogOutput};
use std::path::PathBuf;

/// Username normalization applied before authorization mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeMode {
    Auto,
    PrecisCasefoldEmail,
    PrecisCasefold,
    PrecisEmail,
    Precis,
    Casefold,
    Noop,
}

impl NormalizeMode {
    pub const VALUES: &'static [(&'static str, NormalizeMode)] = &[
        ("auto", NormalizeMode::Auto),
        ("precis_casefold_email", NormalizeMode::PrecisCasefoldEmail),
        ("precis_casefold", NormalizeMode::PrecisCasefold),
        ("precis_email", NormalizeMode::PrecisEmail),
        ("precis", NormalizeMode::Precis),
        ("casefold", NormalizeMode::Casefold),
        ("noop", NormalizeMode::Noop),
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePair {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Where server certificates come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSource {
    Off,
    /// `tls file CERT KEY`, or a block of `file` lines
    Files(Vec<CertificatePair>),
    /// `loader NAME { ... }`, handled by a certificate loader module
    Loader(ConfigNode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub source: TlsSource,
    /// `protocols MIN [MAX]`
    pub protocols: Option<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsClientSettings {
    pub root_ca: Vec<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub protocols: Option<(String, String)>,
}

/// Values of the global directives
pub struct Globals {
    pub state_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub hostname: Option<String>,
    pub autogenerated_msg_domain: Option<String>,
    pub tls: Option<TlsSettings>,
    pub tls_client: Option<TlsClientSettings>,
    pub storage_perdomain: Option<bool>,
    pub auth_perdomain: Option<bool>,
    pub auth_domains: Vec<String>,
    pub auth_map_normalize: NormalizeMode,
    /// Authorization mapping table reference, resolved at startup before
    /// any endpoint; see [`crate::module::Resolver::auth_map`].
    pub auth_map: Option<ConfigNode>,
    /// Process log output; also carries the debug flag
    pub log: LogHandle,
}

impl Globals {
    /// Globals with every directive at its default.
    pub fn defaults(log: LogHandle) -> Self {
        Self {
            state_dir: dirs::default_state_dir(),
            runtime_dir: dirs::default_runtime_dir(),
            hostname: None,
            autogenerated_msg_domain: None,
            tls: None,
            tls_client: None,
            storage_perdomain: None,
            auth_perdomain: None,
            auth_domains: Vec::new(),
            auth_map_normalize: NormalizeMode::Auto,
            auth_map: None,
            log,
        }
    }

    pub fn debug(&self) -> bool {
        self.log.is_debug()
    }
}

/// Split global directives from module blocks.
///
/// The `log` and `debug` directives are applied to `log` only once every
/// global parsed successfully.
pub fn read_globals(nodes: Vec<ConfigNode>, log: &LogHandle) -> Result<(Globals, Vec<ConfigNode>)> {
    let root = config::root(nodes);
    let mut globals = Globals::defaults(log.clone());

    let mut state_dir = None;
    let mut runtime_dir = None;
    let mut log_output: Option<LogOutput> = None;
    let mut debug = log.is_debug();

    let remaining = {
        let mut m = DirectiveMap::new(&root);
        m.string("state_dir", false, &mut state_dir);
        m.string("runtime_dir", false, &mut runtime_dir);
        m.string("hostname", false, &mut globals.hostname);
        m.string(
            "autogenerated_msg_domain",
            false,
            &mut globals.autogenerated_msg_domain,
        );
        m.custom("tls", false, parse_tls, &mut globals.tls);
        m.custom("tls_client", false, parse_tls_client, &mut globals.tls_client);
        m.opt_bool("storage_perdomain", &mut globals.storage_perdomain);
        m.opt_bool("auth_perdomain", &mut globals.auth_perdomain);
        m.string_list("auth_domains", false, &mut globals.auth_domains);
        m.custom("log", false, parse_log, &mut log_output);
        m.bool("debug", &mut debug);
        m.enumeration(
            "auth_map_normalize",
            NormalizeMode::VALUES,
            &mut globals.auth_map_normalize,
        );
        m.node("auth_map", false, &mut globals.auth_map);
        m.allow_unknown();
        m.process()?
    };

    if let Some(dir) = state_dir {
        globals.state_dir = PathBuf::from(dir);
    }
    if let Some(dir) = runtime_dir {
        globals.runtime_dir = PathBuf::from(dir);
    }
    if let Some(output) = log_output {
        log.replace(output)?;
    }
    log.set_debug(debug);

    Ok((globals, remaining))
}

fn parse_log(node: &ConfigNode) -> Result<LogOutput> {
    node.expect_no_block()?;
    if node.args.is_empty() {
        return Err(node.error("log: expected at least 1 argument"));
    }
    LogOutput::from_args(&node.args).map_err(|e| node.error(format!("log: {}", e)))
}

fn parse_protocols(node: &ConfigNode) -> Result<(String, String)> {
    node.expect_no_block()?;
    match node.args.as_slice() {
        [only] => Ok((only.clone(), only.clone())),
        [min, max] => Ok((min.clone(), max.clone())),
        _ => Err(node.error("protocols: expected 1 or 2 arguments")),
    }
}

fn parse_tls(node: &ConfigNode) -> Result<TlsSettings> {
    match node.args.as_slice() {
        [off] if off == "off" => {
            node.expect_no_block()?;
            return Ok(TlsSettings {
                source: TlsSource::Off,
                protocols: None,
            });
        }
        [kind, cert, key] if kind == "file" => {
            let mut settings = TlsSettings {
                source: TlsSource::Files(vec![CertificatePair {
                    cert: PathBuf::from(cert),
                    key: PathBuf::from(key),
                }]),
                protocols: None,
            };
            read_tls_options(node, &mut settings)?;
            return Ok(settings);
        }
        [] => {}
        _ => return Err(node.error("tls: expected 'off', 'file CERT KEY' or a block")),
    }

    if !node.has_block() {
        return Err(node.error("tls: expected 'off', 'file CERT KEY' or a block"));
    }

    let mut settings = TlsSettings {
        source: TlsSource::Files(Vec::new()),
        protocols: None,
    };
    read_tls_options(node, &mut settings)?;

    if let TlsSource::Files(pairs) = &settings.source {
        if pairs.is_empty() {
            return Err(node.error("tls: no certificate source configured"));
        }
    }
    Ok(settings)
}

fn read_tls_options(node: &ConfigNode, settings: &mut TlsSettings) -> Result<()> {
    let mut pairs = Vec::new();
    let mut loader = None;
    let mut protocols = None;

    let mut m = DirectiveMap::new(node);
    m.repeated("file", |n| {
        n.expect_no_block()?;
        n.expect_args(2)?;
        pairs.push(CertificatePair {
            cert: PathBuf::from(&n.args[0]),
            key: PathBuf::from(&n.args[1]),
        });
        Ok(())
    });
    m.node("loader", false, &mut loader);
    m.custom("protocols", false, parse_protocols, &mut protocols);
    m.process()?;

    if let Some(loader) = loader {
        if !pairs.is_empty() || matches!(&settings.source, TlsSource::Files(p) if !p.is_empty()) {
            return Err(node.error("tls: 'loader' can't be combined with certificate files"));
        }
        settings.source = TlsSource::Loader(loader);
    } else if let TlsSource::Files(existing) = &mut settings.source {
        existing.extend(pairs);
    }
    settings.protocols = protocols;
    Ok(())
}

fn parse_tls_client(node: &ConfigNode) -> Result<TlsClientSettings> {
    if !node.args.is_empty() {
        return Err(node.error("tls_client: expected a block"));
    }

    let mut root_ca = Vec::new();
    let mut cert = None;
    let mut key = None;
    let mut protocols = None;
    {
        let mut m = DirectiveMap::new(node);
        m.string_list("root_ca", false, &mut root_ca);
        m.string("cert", false, &mut cert);
        m.string("key", false, &mut key);
        m.custom("protocols", false, parse_protocols, &mut protocols);
        m.process()?;
    }

    if cert.is_some() != key.is_some() {
        return Err(node.error("tls_client: both cert and key must be specified"));
    }

    Ok(TlsClientSettings {
        root_ca: root_ca.into_iter().map(PathBuf::from).collect(),
        cert: cert.map(PathBuf::from),
        key: key.map(PathBuf::from),
        protocols,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse;

    fn read(text: &str) -> Result<(Globals, Vec<ConfigNode>)> {
        read_globals(parse(text, "g.conf").unwrap(), &LogHandle::default())
    }

    #[test]
    fn test_unknown_nodes_forwarded_in_order() {
        let (globals, rest) = read(
            "hostname mx.example.org\nsmtp tcp://0.0.0.0:25\nauth_domains a.org b.org\nstorage.maildir local\n",
        )
        .unwrap();
        assert_eq!(globals.hostname.as_deref(), Some("mx.example.org"));
        assert_eq!(globals.auth_domains, vec!["a.org", "b.org"]);
        let names: Vec<&str> = rest.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["smtp", "storage.maildir"]);
    }

    #[test]
    fn test_defaults() {
        let (globals, rest) = read("\n").unwrap();
        assert!(rest.is_empty());
        assert_eq!(globals.auth_map_normalize, NormalizeMode::Auto);
        assert!(globals.tls.is_none());
        assert!(!globals.debug());
        assert_eq!(globals.state_dir, dirs::default_state_dir());
    }

    #[test]
    fn test_malformed_global_reports_location() {
        let err = read("\nhostname\n").err().unwrap();
        assert!(err.to_string().starts_with("g.conf:2:"));
    }

    #[test]
    fn test_debug_applied_only_on_success() {
        let log = LogHandle::default();
        let nodes = parse("debug yes\nhostname a b\n", "g.conf").unwrap();
        assert!(read_globals(nodes, &log).is_err());
        assert!(!log.is_debug());

        let nodes = parse("debug yes\n", "g.conf").unwrap();
        let (globals, _) = read_globals(nodes, &log).unwrap();
        assert!(globals.debug());
    }

    #[test]
    fn test_tls_variants() {
        let (globals, _) = read("tls off\n").unwrap();
        assert_eq!(globals.tls.unwrap().source, TlsSource::Off);

        let (globals, _) = read("tls file cert.pem key.pem\n").unwrap();
        match globals.tls.unwrap().source {
            TlsSource::Files(pairs) => assert_eq!(pairs[0].cert, PathBuf::from("cert.pem")),
            other => panic!("unexpected source {:?}", other),
        }

        let (globals, _) = read("tls {\n    loader acme {\n        agreed\n    }\n    protocols tls1.2 tls1.3\n}\n").unwrap();
        let tls = globals.tls.unwrap();
        assert!(matches!(tls.source, TlsSource::Loader(_)));
        assert_eq!(tls.protocols, Some(("tls1.2".to_string(), "tls1.3".to_string())));

        assert!(read("tls bogus\n").is_err());
    }

    #[test]
    fn test_tls_client_requires_pair() {
        assert!(read("tls_client {\n    cert c.pem\n}\n").is_err());
        let (globals, _) = read("tls_client {\n    root_ca ca.pem\n}\n").unwrap();
        assert_eq!(globals.tls_client.unwrap().root_ca, vec![PathBuf::from("ca.pem")]);
    }

    #[test]
    fn test_normalize_and_auth_map() {
        let (globals, _) = read("auth_map_normalize casefold\nauth_map &aliases\n").unwrap();
        assert_eq!(globals.auth_map_normalize, NormalizeMode::Casefold);
        assert_eq!(globals.auth_map.unwrap().args, vec!["&aliases"]);
        assert!(read("auth_map_normalize shouting\n").is_err());
    }
}
