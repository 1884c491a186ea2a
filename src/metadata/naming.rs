use serde::{Deserialize, Serialize};

/// Translation between client-side and server-side property names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NamingConvention {
    /// Names are identical on both sides.
    #[default]
    None,
    /// Client uses camelCase, the server PascalCase.
    CamelCase,
}

impl NamingConvention {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::CamelCase => "camelCase",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" | "nonamingconvention" => Some(Self::None),
            "camelcase" => Some(Self::CamelCase),
            _ => None,
        }
    }

    pub fn server_to_client(&self, name: &str) -> String {
        match self {
            Self::None => name.to_string(),
            Self::CamelCase => recase_first(name, char::to_ascii_lowercase),
        }
    }

    pub fn client_to_server(&self, name: &str) -> String {
        match self {
            Self::None => name.to_string(),
            Self::CamelCase => recase_first(name, char::to_ascii_uppercase),
        }
    }

    /// Convert every segment of a dotted or slashed property path.
    pub fn path_to_server(&self, path: &str, separator: &str) -> String {
        path.split(['.', '/'])
            .map(|segment| self.client_to_server(segment))
            .collect::<Vec<_>>()
            .join(separator)
    }
}

fn recase_first(name: &str, f: fn(&char) -> char) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => std::iter::once(f(&first)).chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case_round_trip() {
        let convention = NamingConvention::CamelCase;
        assert_eq!(convention.server_to_client("CompanyName"), "companyName");
        assert_eq!(convention.client_to_server("companyName"), "CompanyName");
        assert_eq!(
            convention.path_to_server("customer.companyName", "/"),
            "Customer/CompanyName"
        );
    }

    #[test]
    fn test_none_is_identity() {
        assert_eq!(NamingConvention::None.client_to_server("freight"), "freight");
        assert_eq!(NamingConvention::from_name("camelCase"), Some(NamingConvention::CamelCase));
    }
}
