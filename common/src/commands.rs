#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sequence: i64,
    pub chat_id: i64,
    pub author_id: i64,
    pub author_name: String,
    pub text: String,
}

impl InboundMessage {
    /// `(name) id=123`, shown in replies and notices.
    pub fn who(&self) -> String {
        if self.author_name.is_empty() {
            format!("id={}", self.author_id)
        } else {
            format!("({}) id={}", self.author_name, self.author_id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    MyId,
    Help,
    Status,
    SpecialDays,
    AdminList,
    AdminAdd(Option<i64>),
    AdminDel(Option<i64>),
    On,
    Off,
    Refresh,
}

impl Command {
    /// Commands match exactly or with an `@botname` suffix. Unknown text is
    /// `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let head = text.split_whitespace().next()?;

        let command = if is_command(head, &["/myid"]) {
            Self::MyId
        } else if is_command(head, &["/help", "/yardim", "/yardım", "/start"]) {
            Self::Help
        } else if is_command(head, &["/durum", "/status"]) {
            Self::Status
        } else if is_command(head, &["/dinigunler", "/dinigünler"]) {
            Self::SpecialDays
        } else if is_command(head, &["/admin_list", "/admins"]) {
            Self::AdminList
        } else if is_command(head, &["/admin_add"]) {
            Self::AdminAdd(id_argument(text))
        } else if is_command(head, &["/admin_del"]) {
            Self::AdminDel(id_argument(text))
        } else if is_command(head, &["/on"]) {
            Self::On
        } else if is_command(head, &["/off"]) {
            Self::Off
        } else if is_command(head, &["/guncelle", "/güncelle", "/update"]) {
            Self::Refresh
        } else {
            return None;
        };
        Some(command)
    }

    pub fn requires_admin(self) -> bool {
        matches!(
            self,
            Self::AdminList
                | Self::AdminAdd(_)
                | Self::AdminDel(_)
                | Self::On
                | Self::Off
                | Self::Refresh
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::MyId => "/myid",
            Self::Help => "/help",
            Self::Status => "/durum",
            Self::SpecialDays => "/dinigunler",
            Self::AdminList => "/admin_list",
            Self::AdminAdd(_) => "/admin_add",
            Self::AdminDel(_) => "/admin_del",
            Self::On => "/on",
            Self::Off => "/off",
            Self::Refresh => "/guncelle",
        }
    }
}

fn is_command(head: &str, names: &[&str]) -> bool {
    let bare = head.split_once('@').map_or(head, |(name, _)| name);
    names.iter().any(|name| bare.eq_ignore_ascii_case(name))
}

fn id_argument(text: &str) -> Option<i64> {
    let (_, rest) = text.split_once(char::is_whitespace)?;
    rest.trim().parse::<i64>().ok().filter(|id| *id != 0)
}

pub const HELP_TEXT: &str = "Komutlar:\n\
/myid - kimliğini göster\n\
/durum - röle ve pencere durumu\n\
/dinigunler - aktif ve yaklaşan dini günler\n\
/on - röleyi aç (admin)\n\
/off - röleyi mevcut pencere sonuna kadar kapat (admin)\n\
/guncelle - vakit takvimini yenile (admin)\n\
/admin_list - adminleri listele (admin)\n\
/admin_add <id> - admin ekle (admin)\n\
/admin_del <id> - admin sil (admin)";

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_aliases_and_bot_suffix() {
        assert_eq!(Command::parse("/durum"), Some(Command::Status));
        assert_eq!(Command::parse("/status@prayer_relay_bot"), Some(Command::Status));
        assert_eq!(Command::parse("/yardım"), Some(Command::Help));
        assert_eq!(Command::parse("/dinigünler"), Some(Command::SpecialDays));
        assert_eq!(Command::parse("/admins"), Some(Command::AdminList));
        assert_eq!(Command::parse("/update"), Some(Command::Refresh));
        assert_eq!(Command::parse("  /on  "), Some(Command::On));
        assert_eq!(Command::parse("/onx"), None);
        assert_eq!(Command::parse("merhaba"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn admin_commands_take_an_id() {
        assert_eq!(Command::parse("/admin_add 12345"), Some(Command::AdminAdd(Some(12345))));
        assert_eq!(Command::parse("/admin_del@bot  -77"), Some(Command::AdminDel(Some(-77))));
        assert_eq!(Command::parse("/admin_add"), Some(Command::AdminAdd(None)));
        assert_eq!(Command::parse("/admin_add 0"), Some(Command::AdminAdd(None)));
        assert_eq!(Command::parse("/admin_add abc"), Some(Command::AdminAdd(None)));
    }

    #[test]
    fn gating() {
        assert!(!Command::MyId.requires_admin());
        assert!(!Command::Status.requires_admin());
        assert!(!Command::SpecialDays.requires_admin());
        assert!(Command::On.requires_admin());
        assert!(Command::Refresh.requires_admin());
        assert!(Command::AdminAdd(None).requires_admin());
    }

    #[test]
    fn who_includes_name_when_present() {
        let mut msg = InboundMessage {
            sequence: 1,
            chat_id: 1,
            author_id: 42,
            author_name: "Ali".to_string(),
            text: String::new(),
        };
        assert_eq!(msg.who(), "(Ali) id=42");
        msg.author_name.clear();
        assert_eq!(msg.who(), "id=42");
    }
}
