//! Localstack: local AWS service emulation.

use std::path::PathBuf;

use serde_json::Value;

use crate::error::Result;
use crate::lifecycle::{InstanceHandle, InstanceSpec, Payload, SetupStep};
use crate::runtime::ExecOutput;
use crate::services::{Service, WAIT_ATTEMPTS, retry_script};

const REGION: &str = "us-east-1";

/// An AWS service Localstack can emulate, each on its own port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalstackService {
    Sqs,
    ApiGateway,
    Kinesis,
    S3,
    DynamoDb,
    DynamoDbStreams,
    Elasticsearch,
    Firehose,
    Lambda,
    Sns,
    Redshift,
    Es,
    Ses,
    Route53,
    CloudFormation,
    CloudWatch,
    Ssm,
    SecretsManager,
}

impl LocalstackService {
    pub const ALL: [LocalstackService; 18] = [
        LocalstackService::Sqs,
        LocalstackService::ApiGateway,
        LocalstackService::Kinesis,
        LocalstackService::S3,
        LocalstackService::DynamoDb,
        LocalstackService::DynamoDbStreams,
        LocalstackService::Elasticsearch,
        LocalstackService::Firehose,
        LocalstackService::Lambda,
        LocalstackService::Sns,
        LocalstackService::Redshift,
        LocalstackService::Es,
        LocalstackService::Ses,
        LocalstackService::Route53,
        LocalstackService::CloudFormation,
        LocalstackService::CloudWatch,
        LocalstackService::Ssm,
        LocalstackService::SecretsManager,
    ];

    /// Name used in the `SERVICES` variable.
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalstackService::Sqs => "sqs",
            LocalstackService::ApiGateway => "apigateway",
            LocalstackService::Kinesis => "kinesis",
            LocalstackService::S3 => "s3",
            LocalstackService::DynamoDb => "dynamodb",
            LocalstackService::DynamoDbStreams => "dynamodbstreams",
            LocalstackService::Elasticsearch => "elasticsearch",
            LocalstackService::Firehose => "firehose",
            LocalstackService::Lambda => "lambda",
            LocalstackService::Sns => "sns",
            LocalstackService::Redshift => "redshift",
            LocalstackService::Es => "es",
            LocalstackService::Ses => "ses",
            LocalstackService::Route53 => "route53",
            LocalstackService::CloudFormation => "cloudformation",
            LocalstackService::CloudWatch => "cloudwatch",
            LocalstackService::Ssm => "ssm",
            LocalstackService::SecretsManager => "secretsmanager",
        }
    }

    /// Port inside the container.
    pub fn port(&self) -> u16 {
        match self {
            LocalstackService::ApiGateway => 4567,
            LocalstackService::Kinesis => 4568,
            LocalstackService::DynamoDb => 4569,
            LocalstackService::DynamoDbStreams => 4570,
            LocalstackService::Elasticsearch => 4571,
            LocalstackService::S3 => 4572,
            LocalstackService::Firehose => 4573,
            LocalstackService::Lambda => 4574,
            LocalstackService::Sns => 4575,
            LocalstackService::Sqs => 4576,
            LocalstackService::Redshift => 4577,
            LocalstackService::Es => 4578,
            LocalstackService::Ses => 4579,
            LocalstackService::Route53 => 4580,
            LocalstackService::CloudFormation => 4581,
            LocalstackService::CloudWatch => 4582,
            LocalstackService::Ssm => 4583,
            LocalstackService::SecretsManager => 4584,
        }
    }

    /// A cheap read-only `aws` subcommand that succeeds once the service is up.
    fn probe(&self) -> Option<&'static str> {
        match self {
            LocalstackService::Sqs => Some("sqs list-queues"),
            LocalstackService::ApiGateway => Some("apigateway get-api-keys"),
            LocalstackService::Kinesis => Some("kinesis list-streams"),
            LocalstackService::S3 => Some("s3 ls"),
            LocalstackService::DynamoDb => Some("dynamodb list-tables"),
            LocalstackService::DynamoDbStreams => Some("dynamodbstreams list-streams"),
            LocalstackService::Elasticsearch => None,
            LocalstackService::Firehose => Some("firehose list-delivery-streams"),
            LocalstackService::Lambda => Some("lambda list-functions"),
            LocalstackService::Sns => Some("sns list-topics"),
            LocalstackService::Redshift => Some("redshift describe-tags"),
            LocalstackService::Es => Some("es list-domain-names"),
            LocalstackService::Ses => Some("ses list-identities"),
            LocalstackService::Route53 => Some("route53 list-health-checks"),
            LocalstackService::CloudFormation => Some("cloudformation describe-stacks"),
            LocalstackService::CloudWatch => Some("cloudwatch describe-alarms"),
            LocalstackService::Ssm => Some("ssm list-commands"),
            LocalstackService::SecretsManager => Some("secretsmanager get-random-password"),
        }
    }

    fn endpoint(&self) -> String {
        format!("http://localhost:{}", self.port())
    }

    fn wait_command(&self) -> Option<Vec<String>> {
        let probe = self.probe()?;
        let check = format!("aws --region {REGION} --endpoint-url={} {probe}", self.endpoint());
        let what = format!("localstack - {}", self.as_str());
        Some(vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            retry_script(&check, &what, WAIT_ATTEMPTS),
        ])
    }
}

/// An SQS queue created at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqsQueue {
    pub name: String,
}

impl SqsQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn url(&self) -> String {
        format!("{}/queue/{}", LocalstackService::Sqs.endpoint(), self.name)
    }

    pub fn create_command(&self) -> Vec<String> {
        aws(LocalstackService::Sqs, &["sqs", "create-queue", "--queue-name", &self.name])
    }

    /// Send `message` to this queue inside a running instance.
    pub async fn send_message(&self, instance: &InstanceHandle, message: &str) -> Result<ExecOutput> {
        let url = self.url();
        let argv = aws(
            LocalstackService::Sqs,
            &["sqs", "send-message", "--queue-url", &url, "--message-body", message],
        );
        instance.exec(&argv).await
    }
}

/// A Go lambda created at startup from a zip on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LambdaFunction {
    pub function_name: String,
    pub handler: String,
    pub zip: PathBuf,
}

impl LambdaFunction {
    pub fn new(function_name: impl Into<String>, handler: impl Into<String>, zip: impl Into<PathBuf>) -> Self {
        Self {
            function_name: function_name.into(),
            handler: handler.into(),
            zip: zip.into(),
        }
    }

    fn zip_name(&self) -> String {
        self.zip
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn create_command(&self) -> Vec<String> {
        let zip = format!("fileb:///{}", self.zip_name());
        aws(
            LocalstackService::Lambda,
            &[
                "lambda",
                "create-function",
                "--function-name",
                &self.function_name,
                "--handler",
                &self.handler,
                "--memory",
                "128",
                "--role",
                "r1",
                "--runtime",
                "go1.x",
                "--zip-file",
                &zip,
            ],
        )
    }

    /// Invoke the function with `payload` serialized as JSON.
    ///
    /// The JSON travels as a single argv element, so no shell quoting
    /// applies.
    pub async fn send_payload(&self, instance: &InstanceHandle, payload: &Value) -> Result<ExecOutput> {
        let body = payload.to_string();
        let argv = aws(
            LocalstackService::Lambda,
            &[
                "lambda",
                "invoke",
                "--function-name",
                &self.function_name,
                "--payload",
                &body,
                "/tmp/output.out",
            ],
        );
        instance.exec(&argv).await
    }
}

/// `aws --region R --endpoint-url E <args>` against one service's port.
fn aws(service: LocalstackService, args: &[&str]) -> Vec<String> {
    let mut argv = vec![
        "aws".to_string(),
        "--region".to_string(),
        REGION.to_string(),
        "--endpoint-url".to_string(),
        service.endpoint(),
    ];
    argv.extend(args.iter().map(|s| s.to_string()));
    argv
}

/// Localstack with selected services, queues and lambdas.
///
/// Selecting no services starts all of them, which is heavy; list only
/// what the test needs. Lambdas run in sibling containers, so the engine
/// socket is bind-mounted.
#[derive(Debug, Clone, Default)]
pub struct Localstack {
    pub name: String,
    pub services: Vec<LocalstackService>,
    pub queues: Vec<SqsQueue>,
    pub functions: Vec<LambdaFunction>,
    pub env: Vec<(String, String)>,
}

impl Localstack {
    pub const IMAGE: &'static str = "localstack/localstack";
    pub const ENGINE_SOCKET: &'static str = "/var/run/docker.sock";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_services(mut self, services: impl IntoIterator<Item = LocalstackService>) -> Self {
        self.services.extend(services);
        self
    }

    pub fn add_queue(mut self, name: impl Into<String>) -> Self {
        self.queues.push(SqsQueue::new(name));
        self
    }

    pub fn add_function(
        mut self,
        function_name: impl Into<String>,
        handler: impl Into<String>,
        zip: impl Into<PathBuf>,
    ) -> Self {
        self.functions.push(LambdaFunction::new(function_name, handler, zip));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn queue(&self, name: &str) -> Option<&SqsQueue> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&LambdaFunction> {
        self.functions.iter().find(|f| f.function_name == name)
    }

    /// Selected services, or all of them when none were selected.
    pub fn active_services(&self) -> &[LocalstackService] {
        if self.services.is_empty() {
            &LocalstackService::ALL
        } else {
            &self.services
        }
    }

    /// Host port for `service` on a running instance.
    pub fn host_port(instance: &InstanceHandle, service: LocalstackService) -> Option<u16> {
        instance.host_port(service.port())
    }
}

impl Service for Localstack {
    fn spec(&self) -> Result<InstanceSpec> {
        let services = self.active_services();
        let names: Vec<&str> = services.iter().map(|s| s.as_str()).collect();
        let socket = Self::ENGINE_SOCKET;

        let mut spec = InstanceSpec::new("localstack", Self::IMAGE)
            .named(&self.name)
            .env("SERVICES", names.join(","))
            .env("AWS_SECRET_ACCESS_KEY", "guest")
            .env("AWS_ACCESS_KEY_ID", "guest")
            .env("LAMBDA_EXECUTOR", "docker")
            .bind(format!("{socket}:{socket}"));

        for (key, value) in &self.env {
            spec = spec.env(key, value);
        }
        for service in services {
            spec = spec.port(service.port());
        }
        for function in &self.functions {
            spec = spec.payload(Payload::path(&function.zip, "/"));
        }

        spec = spec
            .setup(SetupStep::run(["pip", "install", "awscli", "--upgrade", "--user"]))
            .setup(SetupStep::Parallel(
                services.iter().filter_map(|s| s.wait_command()).collect(),
            ));

        for queue in &self.queues {
            spec = spec.after_ready(SetupStep::Run(queue.create_command()));
        }
        for function in &self.functions {
            spec = spec.after_ready(SetupStep::Run(function.create_command()));
        }
        Ok(spec)
    }
}
