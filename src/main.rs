use std::path::PathBuf;

use clap::Parser;
use iam_provision::{
    ProvisionError,
    backend::{AssumeRole, BackendClient, SsoPrincipalType},
    config::{ConfigError, DEFAULT_CONFIG, ProvisionerConfig},
    observability::{TracingError, init_tracing},
    policy::{
        PolicySourceOptions, synthesize,
        trust::{ArchetypeParams, RoleType, TrustArchetype},
        validate, validate_file,
    },
    services::{
        Attached, CreateRoleRequest, CreateUserInGroup, CredentialCache, EMERGENCY_GROUP_NAME,
        EMERGENCY_MANAGED_POLICY, EmergencyGroupRequest, Ensured, IssueMode, IssuedKey, KeyOrigin,
        PermissionSetRef, PermissionSetSpec, Provisioner, SsoPrincipal,
    },
};

const CONFIG_FILE_NAME: &str = "iam-provision.toml";

/// CLI arguments for iam-provision
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Idempotent provisioning of AWS IAM users, groups, roles, access keys and SSO assignments",
    long_about = None
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (defaults to ./iam-provision.toml, then
    /// ~/.config/iam-provision/iam-provision.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

/// Where a group, role or permission set policy comes from. At most one may be given.
#[derive(clap::Args, Debug, Default)]
struct PolicyArgs {
    /// AWS managed policy name (e.g. ReadOnlyAccess) or full policy ARN
    #[arg(long)]
    managed_policy: Option<String>,
    /// Inline policy document as a JSON string
    #[arg(long)]
    policy_json: Option<String>,
    /// Path to a JSON policy document
    #[arg(long)]
    policy_file: Option<PathBuf>,
}

impl From<PolicyArgs> for PolicySourceOptions {
    fn from(args: PolicyArgs) -> Self {
        PolicySourceOptions {
            managed: args.managed_policy,
            inline: args.policy_json,
            file: args.policy_file,
        }
    }
}

/// Trust parameters; which ones apply depends on the role type.
#[derive(clap::Args, Debug, Default)]
struct TrustArgs {
    /// Account trusted by a cross-account role
    #[arg(long)]
    trust_account_id: Option<String>,
    /// External id required by a cross-account role
    #[arg(long)]
    external_id: Option<String>,
    /// Service principal of a service-linked role (e.g. autoscaling.amazonaws.com)
    #[arg(long)]
    service_name: Option<String>,
    /// Suffix for a service-linked role name
    #[arg(long)]
    custom_suffix: Option<String>,
    /// Custom trust document as a JSON string
    #[arg(long)]
    trust_policy_json: Option<String>,
    /// Path to a custom trust document
    #[arg(long)]
    trust_policy_file: Option<PathBuf>,
}

impl From<TrustArgs> for ArchetypeParams {
    fn from(args: TrustArgs) -> Self {
        ArchetypeParams {
            trust_account_id: args.trust_account_id,
            external_id: args.external_id,
            service_name: args.service_name,
            custom_suffix: args.custom_suffix,
            trust_policy_json: args.trust_policy_json,
            trust_policy_file: args.trust_policy_file,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum PrincipalTypeArg {
    User,
    Group,
}

impl From<PrincipalTypeArg> for SsoPrincipalType {
    fn from(value: PrincipalTypeArg) -> Self {
        match value {
            PrincipalTypeArg::User => SsoPrincipalType::User,
            PrincipalTypeArg::Group => SsoPrincipalType::Group,
        }
    }
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Create a user in a group, creating the group and its policy if needed
    CreateUser {
        /// IAM user name
        user: String,
        /// Group the user is added to
        #[arg(long)]
        group: String,
        #[command(flatten)]
        policy: PolicyArgs,
        /// Inline policy name suffix: {group}{suffix}Policy
        #[arg(long, default_value = "Group")]
        policy_suffix: String,
        /// Issue an access key for the user (reuses a cached key when present)
        #[arg(long)]
        access_key: bool,
        /// Ignore any cached key and issue a fresh one, rotating out the oldest if needed
        #[arg(long, requires = "access_key")]
        rotate: bool,
    },
    /// Create a role from a trust archetype
    CreateRole {
        /// Role name
        name: String,
        /// ec2, lambda, cross-account, service-linked or custom
        #[arg(long = "type")]
        role_type: RoleType,
        #[command(flatten)]
        trust: TrustArgs,
        #[arg(long)]
        description: Option<String>,
        /// Maximum session duration in seconds
        #[arg(long)]
        max_session_duration: Option<i32>,
        #[command(flatten)]
        policy: PolicyArgs,
    },
    /// Create the break-glass group
    CreateEmergencyGroup {
        #[arg(long, default_value = EMERGENCY_GROUP_NAME)]
        group: String,
        #[command(flatten)]
        policy: PolicyArgs,
        /// Existing users to add (repeatable)
        #[arg(long = "member")]
        members: Vec<String>,
    },
    /// Create an Identity Center permission set with an optional policy
    CreateSsoPermissionSet {
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// ISO-8601 duration, e.g. PT8H
        #[arg(long)]
        session_duration: Option<String>,
        #[command(flatten)]
        policy: PolicyArgs,
    },
    /// Assign a permission set to an Identity Center user or group on an account
    AssignSso {
        /// Permission set name (exact match) or ARN
        #[arg(long)]
        permission_set: String,
        #[arg(long, value_enum)]
        principal_type: PrincipalTypeArg,
        /// Identity store id of the user or group
        #[arg(long)]
        principal_id: String,
        /// Account receiving the assignment
        #[arg(long)]
        account_id: String,
    },
    /// Issue an access key for an existing user
    IssueAccessKey {
        user: String,
        /// Ignore any cached key and issue a fresh one
        #[arg(long)]
        rotate: bool,
    },
    /// Obtain temporary credentials for a role, printed as shell exports
    AssumeRole {
        role_arn: String,
        #[arg(long, default_value = "iam-provision")]
        session_name: String,
        #[arg(long)]
        external_id: Option<String>,
        #[arg(long)]
        duration_seconds: Option<i32>,
    },
    /// Print the trust document a role type would be created with
    TrustPolicy {
        #[arg(long = "type")]
        role_type: RoleType,
        #[command(flatten)]
        trust: TrustArgs,
        /// ARN partition (defaults to the configured backend's)
        #[arg(long)]
        partition: Option<String>,
    },
    /// Check that a policy document is well-formed JSON
    ValidatePolicy {
        /// Path to the policy document; reads the JSON argument when omitted
        #[arg(long, conflicts_with = "json")]
        file: Option<PathBuf>,
        json: Option<String>,
    },
    /// Initialize a new configuration file
    Init {
        /// Path to create the config file (defaults to ./iam-provision.toml)
        #[arg(short, long)]
        output: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tracing(#[from] TracingError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("{0}")]
    Usage(String),
}

/// Get the default config file path.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("iam-provision").join(CONFIG_FILE_NAME))
}

/// Resolve the config path. `None` means no file was found and defaults apply.
fn resolve_config_path(explicit_path: Option<&str>) -> Result<Option<PathBuf>, CliError> {
    if let Some(path) = explicit_path {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(CliError::Usage(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        return Ok(Some(path));
    }

    let cwd_config = PathBuf::from(CONFIG_FILE_NAME);
    if cwd_config.exists() {
        return Ok(Some(cwd_config));
    }

    Ok(default_config_path().filter(|p| p.exists()))
}

fn load_config(explicit_path: Option<&str>) -> Result<ProvisionerConfig, CliError> {
    match resolve_config_path(explicit_path)? {
        Some(path) => Ok(ProvisionerConfig::from_file(path)?),
        None => Ok(ProvisionerConfig::default()),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "Command failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    if let Command::Init { output, force } = &args.command {
        return run_init(output.as_deref(), *force);
    }

    let config = load_config(args.config.as_deref())?;
    init_tracing(&config.observability)?;

    match args.command {
        Command::TrustPolicy {
            role_type,
            trust,
            partition,
        } => {
            let archetype = TrustArchetype::from_params(role_type, trust.into())?;
            let partition = partition.unwrap_or_else(|| config.backend.partition().to_string());
            let document = synthesize(&archetype, &partition)?;
            match document.as_json() {
                Some(json) => println!("{json}"),
                None => {
                    return Err(CliError::Usage(
                        "service-linked roles use a trust document defined by the service".into(),
                    ));
                }
            }
            Ok(())
        }
        Command::ValidatePolicy { file, json } => {
            let parsed = match (file, json) {
                (Some(path), _) => validate_file(&path).map_err(ProvisionError::from)?,
                (None, Some(json)) => validate(&json).map_err(ProvisionError::from)?,
                (None, None) => {
                    return Err(CliError::Usage(
                        "provide a policy document or --file".into(),
                    ));
                }
            };
            println!("{}", parsed.to_json());
            Ok(())
        }
        command => {
            let provisioner = connect(&config).await?;
            run_provisioning(&provisioner, command).await
        }
    }
}

async fn connect(config: &ProvisionerConfig) -> Result<Provisioner, CliError> {
    let client = BackendClient::connect(&config.backend)
        .await
        .map_err(ProvisionError::from)?;
    let cache = CredentialCache::new(
        config.credentials.cache_dir.clone(),
        config.credentials.file_mode,
    );
    Ok(Provisioner::new(
        client,
        cache,
        config.sso.instance_arn.clone(),
    ))
}

async fn run_provisioning(provisioner: &Provisioner, command: Command) -> Result<(), CliError> {
    match command {
        Command::CreateUser {
            user,
            group,
            policy,
            policy_suffix,
            access_key,
            rotate,
        } => {
            let request = CreateUserInGroup {
                user_name: user,
                group_name: group,
                policy: PolicySourceOptions::from(policy).resolve()?,
                policy_suffix,
                access_key: access_key.then_some(issue_mode(rotate)),
            };
            let result = provisioner.create_user_in_group(&request).await?;
            print_ensured("group", &result.group);
            if let Some(attached) = &result.policy {
                print_attached(attached);
            }
            print_ensured("user", &result.user);
            if result.added_to_group {
                println!("added {} to {}", request.user_name, request.group_name);
            }
            if let Some(key) = &result.access_key {
                print_key(key);
            }
        }
        Command::CreateRole {
            name,
            role_type,
            trust,
            description,
            max_session_duration,
            policy,
        } => {
            let request = CreateRoleRequest {
                role_name: name,
                archetype: TrustArchetype::from_params(role_type, trust.into())?,
                description,
                max_session_duration,
                policy: PolicySourceOptions::from(policy).resolve()?,
            };
            let result = provisioner.create_role(&request).await?;
            print_ensured("role", &result.role);
            if let Some(attached) = &result.policy {
                print_attached(attached);
            }
            if let Some(profile) = &result.instance_profile {
                println!("instance profile: {profile}");
            }
        }
        Command::CreateEmergencyGroup {
            group,
            policy,
            members,
        } => {
            let policy = PolicySourceOptions::from(policy)
                .resolve()?
                .unwrap_or_else(|| {
                    iam_provision::policy::PolicySource::Managed(
                        EMERGENCY_MANAGED_POLICY.to_string(),
                    )
                });
            let result = provisioner
                .create_emergency_group(&EmergencyGroupRequest {
                    group_name: group,
                    policy,
                    members,
                })
                .await?;
            print_ensured("group", &result.group);
            print_attached(&result.policy);
            for member in &result.added_members {
                println!("added member: {member}");
            }
        }
        Command::CreateSsoPermissionSet {
            name,
            description,
            session_duration,
            policy,
        } => {
            let spec = PermissionSetSpec {
                name,
                description,
                session_duration,
                policy: PolicySourceOptions::from(policy).resolve()?,
            };
            let (permission_set, created) = provisioner.create_sso_permission_set(&spec).await?;
            let verb = if created { "created" } else { "exists" };
            println!("permission set {verb}: {} ({})", permission_set.name, permission_set.arn);
        }
        Command::AssignSso {
            permission_set,
            principal_type,
            principal_id,
            account_id,
        } => {
            let principal = SsoPrincipal {
                principal_type: principal_type.into(),
                id: principal_id,
            };
            let status = provisioner
                .assign_sso(
                    &principal,
                    &PermissionSetRef::parse(&permission_set),
                    &account_id,
                )
                .await?;
            match &status.request_id {
                Some(request_id) => println!("assignment {}: request {request_id}", status.status),
                None => println!("assignment {}", status.status),
            }
        }
        Command::IssueAccessKey { user, rotate } => {
            let key = provisioner.issue_access_key(&user, issue_mode(rotate)).await?;
            print_key(&key);
        }
        Command::AssumeRole {
            role_arn,
            session_name,
            external_id,
            duration_seconds,
        } => {
            let credentials = provisioner
                .assume_role(&AssumeRole {
                    role_arn,
                    session_name,
                    external_id,
                    duration_seconds,
                })
                .await?;
            println!("export AWS_ACCESS_KEY_ID={}", credentials.access_key_id);
            println!("export AWS_SECRET_ACCESS_KEY={}", credentials.secret_access_key);
            println!("export AWS_SESSION_TOKEN={}", credentials.session_token);
            if let Some(expiration) = credentials.expiration {
                println!("# expires {}", expiration.to_rfc3339());
            }
        }
        Command::TrustPolicy { .. } | Command::ValidatePolicy { .. } | Command::Init { .. } => {
            return Err(CliError::Usage("command does not use the backend".into()));
        }
    }
    Ok(())
}

fn issue_mode(rotate: bool) -> IssueMode {
    if rotate {
        IssueMode::ForceRotate
    } else {
        IssueMode::ReuseIfPresent
    }
}

fn print_ensured(label: &str, ensured: &Ensured) {
    let principal = ensured.principal();
    let verb = if ensured.was_created() { "created" } else { "exists" };
    println!("{label} {verb}: {}", principal.arn);
}

fn print_attached(attached: &Attached) {
    match attached {
        Attached::Managed { policy_arn } => println!("attached managed policy: {policy_arn}"),
        Attached::Inline { policy_name } => println!("put inline policy: {policy_name}"),
    }
}

fn print_key(key: &IssuedKey) {
    for rotated in &key.rotated_out {
        println!("deleted access key: {rotated}");
    }
    let origin = match key.origin {
        KeyOrigin::Cache => "cached",
        KeyOrigin::Backend => "issued",
    };
    println!("access key {origin}: {}", key.record.access_key_id);
    println!("secret access key: {}", key.record.secret_access_key);
    println!("saved to: {}", key.cache_path.display());
}

/// Write the starter configuration file.
fn run_init(output: Option<&str>, force: bool) -> Result<(), CliError> {
    let output_path = output
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    if output_path.exists() && !force {
        return Err(CliError::Usage(format!(
            "Config file already exists: {}\nUse --force to overwrite.",
            output_path.display()
        )));
    }

    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            CliError::Usage(format!(
                "Failed to create directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    std::fs::write(&output_path, DEFAULT_CONFIG).map_err(|e| {
        CliError::Usage(format!(
            "Failed to write config file {}: {e}",
            output_path.display()
        ))
    })?;

    println!("Created config file: {}", output_path.display());
    Ok(())
}
