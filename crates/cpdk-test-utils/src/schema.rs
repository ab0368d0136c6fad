//! The appliance schema most tests run against.

use cpdk_config::SchemaConfig;

/// Interfaces are daemon-managed with display-only counters; servers and
/// virtual servers relate many-to-many; a virtual server owns interfaces
/// one-to-many through a read-only relationship.
pub const SAMPLE_SCHEMA: &str = r#"
[[entity]]
name = "Interface"
daemon_managed = true

[[entity.field]]
name = "enabled"
kind = "boolean"
default = false
negative_cmd = "disabled"

[[entity.field]]
name = "packets_in"
kind = "biginteger"
default = 0
display_only = true

[[entity.field]]
name = "packets_out"
kind = "biginteger"
default = 0
display_only = true

[[entity]]
name = "Server"

[[entity.field]]
name = "address"
kind = "string"

[[entity.field]]
name = "port"
kind = "integer"

[[entity.field]]
name = "enabled"
kind = "boolean"

[[entity.relationship]]
name = "virtual_servers"
target = "VirtualServer"
inverse = "servers"

[[entity]]
name = "VirtualServer"

[[entity.field]]
name = "address"
kind = "string"

[[entity.field]]
name = "port"
kind = "integer"

[[entity.field]]
name = "enabled"
kind = "boolean"
default = false

[[entity.relationship]]
name = "servers"
target = "Server"
inverse = "virtual_servers"

[[entity.relationship]]
name = "interfaces"
target = "Interface"
cardinality = "one-to-many"
read_only = true
"#;

/// [`SAMPLE_SCHEMA`], parsed.
pub fn sample_schema() -> SchemaConfig {
    SchemaConfig::parse(SAMPLE_SCHEMA).expect("sample schema is valid")
}
