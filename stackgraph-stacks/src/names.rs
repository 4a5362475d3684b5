//! Resource names used by the two stacks
//!
//! Resource ids are the keys the engine tracks in state; physical names are
//! what AWS or the cluster sees.

/// Scheduled notifier stack
pub mod notifier {
    /// Role the function runs as
    ///
    /// **Outputs:** `name`, `arn`
    pub const LAMBDA_ROLE: &str = "lambda-role";

    /// Policy granting `sns:Publish`
    ///
    /// **Outputs:** `name`, `arn`
    pub const PUBLISH_POLICY: &str = "publish-sns-policy";

    /// Binds [`PUBLISH_POLICY`] to [`LAMBDA_ROLE`]
    pub const ROLE_ATTACHMENT: &str = "lambda-role-attachment";

    /// Topic the function publishes to
    ///
    /// **Outputs:** `name`, `arn`
    pub const TOPIC: &str = "morning-updates";

    /// The scheduled function
    ///
    /// **Outputs:** `name`, `arn`
    pub const FUNCTION: &str = "notifier-function";

    /// Daily trigger
    ///
    /// **Outputs:** `name`, `arn`
    pub const TRIGGER: &str = "morning-trigger";

    /// Points [`TRIGGER`] at [`FUNCTION`]
    pub const EVENT_TARGET: &str = "notifier-event-target";

    /// Lets EventBridge invoke [`FUNCTION`]. Without it the rule fires and
    /// every invocation is rejected.
    pub const INVOKE_PERMISSION: &str = "event-invoke-permission";

    /// Email subscription to [`TOPIC`]
    pub const SUBSCRIPTION: &str = "morning-updates-subscription";

    /// Environment variable carrying the topic ARN into the function
    pub const TOPIC_ARN_ENV: &str = "topic_arn";

    pub const SCHEDULE_EXPRESSION: &str = "cron(0 7 * * ? *)";
    pub const SCHEDULE_DESCRIPTION: &str = "Trigger lambda at 7 each morning";
    pub const EVENTS_PRINCIPAL: &str = "events.amazonaws.com";
    pub const LAMBDA_PRINCIPAL: &str = "lambda.amazonaws.com";
}

/// Jenkins stack; resource ids are `<stack>-<suffix>`
pub mod jenkins {
    pub const NAMESPACE: &str = "namespace";
    pub const CLUSTER_ROLE: &str = "cluster-role";
    pub const SERVICE_ACCOUNT: &str = "service-account";
    pub const CLUSTER_ROLE_BINDING: &str = "cluster-role-binding";
    pub const SECRET: &str = "secret";
    pub const STORAGE_CLASS: &str = "local-storage-class";
    pub const PERSISTENT_VOLUME: &str = "pv-volume";
    pub const PERSISTENT_VOLUME_CLAIM: &str = "pv-claim";
    pub const DEPLOYMENT: &str = "deployment";
    pub const SERVICE: &str = "service";

    /// Workload identity bound to the cluster-wide role
    pub const ADMIN_ACCOUNT: &str = "jenkins-admin";
    pub const STORAGE_CLASS_NAME: &str = "local-storage";
    pub const VOLUME_NAME: &str = "jenkins-pv-volume";
    pub const CLAIM_NAME: &str = "jenkins-pv-claim";
    pub const DEPLOYMENT_NAME: &str = "jenkins";
    pub const SERVICE_NAME: &str = "jenkins-service";
    pub const APP_LABEL: &str = "jenkins-server";
    pub const USERNAME_KEY: &str = "jenkins-username";
    pub const PASSWORD_KEY: &str = "jenkins-password";

    pub const NODE_PORT: i32 = 32000;
    pub const URL_OUTPUT: &str = "URL";
}
