use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            bail!("Empty command");
        }

        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };
        let command = verb.to_uppercase();

        match command.as_str() {
            "HELO" | "EHLO" => {
                if args.is_empty() {
                    bail!("{} requires domain", command);
                }
                if command == "HELO" {
                    Ok(SmtpCommand::Helo(args.to_string()))
                } else {
                    Ok(SmtpCommand::Ehlo(args.to_string()))
                }
            }
            "MAIL" => Ok(SmtpCommand::MailFrom(Self::parse_path(args, "FROM:")?)),
            "RCPT" => {
                let to = Self::parse_path(args, "TO:")?;
                if to.is_empty() {
                    bail!("Empty recipient");
                }
                Ok(SmtpCommand::RcptTo(to))
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// `FROM:<addr> [params]` / `TO:<addr> [params]`
    fn parse_path(args: &str, prefix: &str) -> Result<String> {
        let Some(head) = args.get(..prefix.len()) else {
            bail!("Invalid {} syntax", prefix.trim_end_matches(':'));
        };
        if !head.eq_ignore_ascii_case(prefix) {
            bail!("Invalid {} syntax", prefix.trim_end_matches(':'));
        }

        let rest = args[prefix.len()..].trim();
        let path = rest.split_whitespace().next().unwrap_or("");
        let path = path
            .strip_prefix('<')
            .and_then(|p| p.strip_suffix('>'))
            .unwrap_or(path);
        if path.contains(['\r', '\n', '<', '>']) {
            bail!("Invalid address");
        }
        Ok(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_helo() {
        let cmd = SmtpCommand::parse("HELO example.com").unwrap();
        assert_eq!(cmd, SmtpCommand::Helo("example.com".to_string()));
        assert!(SmtpCommand::parse("EHLO").is_err());
    }

    #[test]
    fn test_parse_mail_from_with_params() {
        let cmd = SmtpCommand::parse("mail from:<sender@example.com> SIZE=100").unwrap();
        assert_eq!(cmd, SmtpCommand::MailFrom("sender@example.com".to_string()));
    }

    #[test]
    fn test_null_sender_allowed() {
        let cmd = SmtpCommand::parse("MAIL FROM:<>").unwrap();
        assert_eq!(cmd, SmtpCommand::MailFrom(String::new()));
        assert!(SmtpCommand::parse("RCPT TO:<>").is_err());
    }

    #[test]
    fn test_parse_rcpt_to() {
        let cmd = SmtpCommand::parse("RCPT TO:<recipient@example.com>").unwrap();
        assert_eq!(cmd, SmtpCommand::RcptTo("recipient@example.com".to_string()));
        assert!(SmtpCommand::parse("RCPT recipient@example.com").is_err());
    }

    #[test]
    fn test_parse_unknown() {
        let cmd = SmtpCommand::parse("vrfy postmaster").unwrap();
        assert_eq!(cmd, SmtpCommand::Unknown("VRFY".to_string()));
    }
}
