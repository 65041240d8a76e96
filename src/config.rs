use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Most options a VM launch accepts
pub const MAX_VM_OPTIONS: usize = 32;

/// Conventional config file name, searched by `BridgeConfig::discover`
pub const CONFIG_FILE: &str = "jbridge.toml";

/// Non-empty entries of a classpath joined with the platform path separator
pub fn split_classpath(classpath: &str) -> Vec<String> {
    std::env::split_paths(classpath)
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Options for starting the foreign VM
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmOptions {
    #[serde(default)]
    pub classpath: Option<String>,

    #[serde(default)]
    pub initial_heap: Option<String>,

    #[serde(default)]
    pub max_heap: Option<String>,

    #[serde(default)]
    pub max_stack: Option<String>,

    /// Extra options passed through verbatim
    #[serde(default)]
    pub vm_args: Vec<String>,
}

impl VmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_classpath(mut self, classpath: impl Into<String>) -> Self {
        self.classpath = Some(classpath.into());
        self
    }

    pub fn with_initial_heap(mut self, size: impl Into<String>) -> Self {
        self.initial_heap = Some(size.into());
        self
    }

    pub fn with_max_heap(mut self, size: impl Into<String>) -> Self {
        self.max_heap = Some(size.into());
        self
    }

    pub fn with_max_stack(mut self, size: impl Into<String>) -> Self {
        self.max_stack = Some(size.into());
        self
    }

    /// Append comma-separated extra options, e.g. `"-Xcheck:jni,-verbose:gc"`
    pub fn with_vm_args(mut self, vm_args: &str) -> Self {
        self.vm_args.extend(
            vm_args
                .split(',')
                .filter(|arg| !arg.is_empty())
                .map(str::to_string),
        );
        self
    }

    /// Whether anything besides the classpath is set; such options only take
    /// effect when the VM is created
    pub fn has_launch_options(&self) -> bool {
        self.initial_heap.is_some()
            || self.max_heap.is_some()
            || self.max_stack.is_some()
            || !self.vm_args.is_empty()
    }

    /// Classpath entries, split on the platform path separator
    pub fn classpath_entries(&self) -> Vec<String> {
        self.classpath.as_deref().map(split_classpath).unwrap_or_default()
    }

    /// Launch option strings in the order the VM receives them
    pub fn render(&self) -> Result<Vec<String>, ConfigError> {
        let mut options = Vec::new();

        if let Some(classpath) = &self.classpath {
            options.push(format!("-Djava.class.path={}", classpath));
        }
        if let Some(size) = &self.initial_heap {
            options.push(format!("-Xms{}", size));
        }
        if let Some(size) = &self.max_heap {
            options.push(format!("-Xmx{}", size));
        }
        if let Some(size) = &self.max_stack {
            options.push(format!("-Xss{}", size));
        }
        options.extend(self.vm_args.iter().cloned());

        if options.len() > MAX_VM_OPTIONS {
            return Err(ConfigError::TooManyOptions {
                limit: MAX_VM_OPTIONS,
            });
        }
        Ok(options)
    }
}

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub vm: VmOptions,

    /// Throwable class raised to carry host errors through foreign code;
    /// needs a `(Ljava/lang/String;)V` constructor
    #[serde(default = "default_carrier_class")]
    pub carrier_class: String,

    /// Let the foreign runtime print exceptions no host handler will see
    #[serde(default = "default_true")]
    pub describe_exceptions: bool,

    /// Bind the carrier class's native `getErrorInfo()V` and `clear()V` at
    /// launch; the carrier class must declare both
    #[serde(default)]
    pub register_carrier_natives: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            vm: VmOptions::default(),
            carrier_class: default_carrier_class(),
            describe_exceptions: true,
            register_carrier_natives: false,
        }
    }
}

fn default_carrier_class() -> String {
    "java/lang/RuntimeException".to_string()
}

fn default_true() -> bool {
    true
}

impl BridgeConfig {
    pub fn new(vm: VmOptions) -> Self {
        Self {
            vm,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Defaults overlaid with `JBRIDGE_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overlay `JBRIDGE_CLASSPATH`, `JBRIDGE_INITIAL_HEAP`, `JBRIDGE_MAX_HEAP`,
    /// `JBRIDGE_MAX_STACK` and `JBRIDGE_VMARGS`
    pub fn with_env_overrides(mut self) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if let Some(classpath) = var("JBRIDGE_CLASSPATH") {
            self.vm.classpath = Some(classpath);
        }
        if let Some(size) = var("JBRIDGE_INITIAL_HEAP") {
            self.vm.initial_heap = Some(size);
        }
        if let Some(size) = var("JBRIDGE_MAX_HEAP") {
            self.vm.max_heap = Some(size);
        }
        if let Some(size) = var("JBRIDGE_MAX_STACK") {
            self.vm.max_stack = Some(size);
        }
        if let Some(args) = var("JBRIDGE_VMARGS") {
            self.vm = std::mem::take(&mut self.vm).with_vm_args(&args);
        }
        self
    }

    /// Find `jbridge.toml` in the current directory or a parent
    pub fn discover() -> Self {
        match std::env::current_dir() {
            Ok(dir) => Self::discover_from(&dir),
            Err(_) => Self::default(),
        }
    }

    /// Nearest `jbridge.toml` in `start` or its ancestors; defaults when
    /// none parses
    pub fn discover_from(start: &Path) -> Self {
        let mut current = Some(start.to_path_buf());

        while let Some(dir) = current {
            let path = dir.join(CONFIG_FILE);
            if path.exists() {
                if let Ok(config) = Self::from_file(&path) {
                    return config;
                }
            }
            current = dir.parent().map(|p| p.to_path_buf());
        }

        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_render_order() {
        let options = VmOptions::new()
            .with_classpath("/opt/lib/a.jar")
            .with_initial_heap("64m")
            .with_max_heap("512m")
            .with_max_stack("1m")
            .with_vm_args("-Xcheck:jni,,-verbose:gc");

        assert_eq!(
            options.render().unwrap(),
            vec![
                "-Djava.class.path=/opt/lib/a.jar",
                "-Xms64m",
                "-Xmx512m",
                "-Xss1m",
                "-Xcheck:jni",
                "-verbose:gc",
            ]
        );
        assert!(options.has_launch_options());
    }

    #[test]
    fn test_classpath_alone_is_not_a_launch_option() {
        let options = VmOptions::new().with_classpath("a.jar");
        assert!(!options.has_launch_options());
        assert_eq!(options.render().unwrap().len(), 1);
    }

    #[test]
    fn test_option_limit() {
        let args: Vec<String> = (0..MAX_VM_OPTIONS).map(|i| format!("-Dp{i}=1")).collect();
        let at_limit = VmOptions::new().with_vm_args(&args.join(","));
        assert_eq!(at_limit.render().unwrap().len(), MAX_VM_OPTIONS);

        let over = at_limit.with_max_heap("1g");
        assert!(matches!(
            over.render(),
            Err(ConfigError::TooManyOptions { limit: MAX_VM_OPTIONS })
        ));
    }

    #[test]
    fn test_classpath_entries() {
        let joined = std::env::join_paths(["a.jar", "b.jar"]).unwrap();
        let options = VmOptions::new().with_classpath(joined.to_string_lossy());
        assert_eq!(options.classpath_entries(), vec!["a.jar", "b.jar"]);
        assert!(VmOptions::new().classpath_entries().is_empty());
    }

    #[test]
    fn test_split_skips_empty_entries() {
        let joined = std::env::join_paths(["a.jar", "", "lib/b.jar"]).unwrap();
        assert_eq!(
            split_classpath(&joined.to_string_lossy()),
            vec!["a.jar", "lib/b.jar"]
        );
        assert!(split_classpath("").is_empty());
    }

    #[test]
    fn test_discover_walks_up_to_the_nearest_file() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("app").join("src");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            root.path().join(CONFIG_FILE),
            "describe_exceptions = false\n[vm]\nmax_heap = \"1g\"\n",
        )
        .unwrap();

        let config = BridgeConfig::discover_from(&nested);
        assert!(!config.describe_exceptions);
        assert_eq!(config.vm.max_heap.as_deref(), Some("1g"));

        let empty = tempfile::tempdir().unwrap();
        assert_eq!(BridgeConfig::discover_from(empty.path()), BridgeConfig::default());
    }

    #[test]
    fn test_toml_defaults() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.carrier_class, "java/lang/RuntimeException");
        assert!(config.describe_exceptions);
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
carrier_class = "org/example/HostError"
describe_exceptions = false

[vm]
classpath = "lib/app.jar"
max_heap = "256m"
vm_args = ["-Xrs"]
"#
        )
        .unwrap();

        let config = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.carrier_class, "org/example/HostError");
        assert!(!config.describe_exceptions);
        assert_eq!(config.vm.max_heap.as_deref(), Some("256m"));
        assert_eq!(config.vm.vm_args, vec!["-Xrs"]);
    }

    #[test]
    fn test_bad_toml_is_a_parse_error() {
        assert!(matches!(
            BridgeConfig::from_toml_str("describe_exceptions = \"maybe\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            BridgeConfig::from_file(Path::new("/nonexistent/jbridge.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
