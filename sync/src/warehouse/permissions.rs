/// A parsed grant entry from a warehouse table ACL.
///
/// ACL strings look like `{user_name=arwdRxt/owner,"group g=r/owner"}`. The
/// entries are reapplied to the staging table during a rebuild so the swapped
/// in table keeps the same access as the one it replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permissions {
    pub name: String,
    pub is_group: bool,
    pub grants: Vec<String>,
    pub owner: String,
}

const ALL_STR: &str = "arwdRxt";
const ALL_GRANTS: &str = "ALL PRIVILEGES";

fn char_to_grant(c: char) -> Option<&'static str> {
    match c {
        'r' => Some("SELECT"),
        'w' => Some("UPDATE"),
        'a' => Some("INSERT"),
        'd' => Some("DELETE"),
        'D' => Some("TRUNCATE"),
        'x' => Some("REFERENCES"),
        't' => Some("TRIGGER"),
        'R' => Some("RULE"),
        _ => None,
    }
}

impl Permissions {
    /// Parses a raw ACL string into grant entries.
    ///
    /// Returns an empty vector for an empty ACL and `None` when the string
    /// cannot be parsed; the caller treats `None` as a migration error since
    /// rebuilding without restoring grants would silently drop access.
    pub fn parse(raw_permissions: &str) -> Option<Vec<Permissions>> {
        if raw_permissions.is_empty() {
            return Some(Vec::new());
        }
        if !raw_permissions.starts_with('{') || !raw_permissions.ends_with('}') {
            return None;
        }

        let mut output = Vec::new();
        for entry in raw_permissions
            .trim_matches(|c| c == '{' || c == '}')
            .split(',')
        {
            let entry = entry.trim_matches('"');
            let (user, permission) = entry.split_once('=')?;
            let (levels, owner) = permission.split_once('/')?;

            let (name, is_group) = if user.is_empty() {
                ("PUBLIC".to_owned(), true)
            } else if let Some(group_name) = user.strip_prefix("group ") {
                (group_name.to_owned(), true)
            } else {
                (user.to_owned(), false)
            };

            // A trailing `*` marks WITH GRANT OPTION, which is not restored.
            let levels_stripped: String = levels.chars().filter(|c| *c != '*').collect();
            let grants = if levels_stripped == ALL_STR {
                vec![ALL_GRANTS.to_owned()]
            } else {
                let mut grants = Vec::with_capacity(levels_stripped.len());
                for c in levels_stripped.chars() {
                    grants.push(char_to_grant(c)?.to_owned());
                }
                grants
            };

            output.push(Permissions {
                name,
                is_group,
                grants,
                owner: owner.to_owned(),
            });
        }

        Some(output)
    }

    /// Renders GRANT statements applying these entries to a table.
    pub fn grant_statements(permissions: &[Permissions], table: &str) -> String {
        permissions
            .iter()
            .flat_map(|p| {
                p.grants.iter().map(move |g| {
                    format!(
                        "GRANT {} ON {} TO {}{};",
                        g,
                        table,
                        if p.is_group { "GROUP " } else { "" },
                        p.name
                    )
                })
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_acl() {
        assert_eq!(Permissions::parse(""), Some(Vec::new()));
    }

    #[test]
    fn parse_unbraced_acl_is_none() {
        assert_eq!(Permissions::parse("user=r/owner"), None);
    }

    #[test]
    fn parse_user_and_group_entries() {
        let parsed =
            Permissions::parse("{alice=arwdRxt/bob,\"group analysts=r/bob\"}").unwrap();

        assert_eq!(
            parsed,
            vec![
                Permissions {
                    name: "alice".to_owned(),
                    is_group: false,
                    grants: vec!["ALL PRIVILEGES".to_owned()],
                    owner: "bob".to_owned(),
                },
                Permissions {
                    name: "analysts".to_owned(),
                    is_group: true,
                    grants: vec!["SELECT".to_owned()],
                    owner: "bob".to_owned(),
                },
            ]
        );
    }

    #[test]
    fn parse_public_entry() {
        let parsed = Permissions::parse("{=r/bob}").unwrap();
        assert_eq!(parsed[0].name, "PUBLIC");
        assert!(parsed[0].is_group);
    }

    #[test]
    fn parse_ignores_grant_option_marker() {
        let parsed = Permissions::parse("{alice=r*w/bob}").unwrap();
        assert_eq!(
            parsed[0].grants,
            vec!["SELECT".to_owned(), "UPDATE".to_owned()]
        );
    }

    #[test]
    fn parse_unknown_grant_char_is_none() {
        assert_eq!(Permissions::parse("{alice=q/bob}"), None);
    }

    #[test]
    fn grant_statements_render_group_prefix() {
        let perms = vec![
            Permissions {
                name: "alice".to_owned(),
                is_group: false,
                grants: vec!["SELECT".to_owned(), "INSERT".to_owned()],
                owner: "bob".to_owned(),
            },
            Permissions {
                name: "analysts".to_owned(),
                is_group: true,
                grants: vec!["SELECT".to_owned()],
                owner: "bob".to_owned(),
            },
        ];

        let sql = Permissions::grant_statements(&perms, "orders_staging");
        assert_eq!(
            sql,
            "GRANT SELECT ON orders_staging TO alice;\n\
             GRANT INSERT ON orders_staging TO alice;\n\
             GRANT SELECT ON orders_staging TO GROUP analysts;"
        );
    }
}
