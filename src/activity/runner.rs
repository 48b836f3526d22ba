//! Activity invocation under the inbound interceptor chain.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::activity::{ActivityContext, ActivityError, ActivityFn};
use crate::messages::failure_from_message;
use crate::proto::{Failure, Payload};

/// Input to one activity execution, as seen by interceptors.
#[derive(Clone)]
pub struct ActivityExecuteInput {
    pub args: Vec<serde_json::Value>,
    /// Raw headers from the scheduling workflow; interceptors that care
    /// decode them with their own converter.
    pub headers: HashMap<String, Payload>,
}

/// User-registered wrapper around inbound activity execution. Interceptors
/// compose as a chain; each receives the input and the next link.
pub trait ActivityInboundInterceptor: Send + Sync {
    fn execute(
        &self,
        input: ActivityExecuteInput,
        next: NextActivityExecutor,
    ) -> BoxFuture<'static, Result<serde_json::Value, ActivityError>>;
}

/// The tail of an interceptor chain: either another interceptor, or the
/// activity function itself.
#[derive(Clone)]
pub struct NextActivityExecutor(
    Arc<
        dyn Fn(ActivityExecuteInput) -> BoxFuture<'static, Result<serde_json::Value, ActivityError>>
            + Send
            + Sync,
    >,
);

impl NextActivityExecutor {
    fn terminal(f: ActivityFn, context: ActivityContext) -> Self {
        Self(Arc::new(move |input: ActivityExecuteInput| {
            f(context.clone(), input.args)
        }))
    }

    fn wrap(self, interceptor: Arc<dyn ActivityInboundInterceptor>) -> Self {
        Self(Arc::new(move |input: ActivityExecuteInput| {
            interceptor.execute(input, self.clone())
        }))
    }

    pub fn call(
        &self,
        input: ActivityExecuteInput,
    ) -> BoxFuture<'static, Result<serde_json::Value, ActivityError>> {
        (self.0)(input)
    }
}

/// Terminal result of one activity attempt.
#[derive(Debug, Clone)]
pub enum ActivityOutcome {
    Completed(serde_json::Value),
    Failed(Failure),
    Cancelled(Vec<serde_json::Value>),
}

/// Run the activity function under the interceptor chain, translating the
/// resolution into a terminal outcome. Cancellation is cooperative: the
/// function observes its token and either returns the cancelled variant or
/// surfaces a cancellation error.
pub(crate) async fn execute_activity(
    context: ActivityContext,
    f: ActivityFn,
    interceptors: &[Arc<dyn ActivityInboundInterceptor>],
    input: ActivityExecuteInput,
) -> ActivityOutcome {
    let mut next = NextActivityExecutor::terminal(f, context.clone());
    for interceptor in interceptors.iter().rev() {
        next = next.wrap(Arc::clone(interceptor));
    }

    match next.call(input).await {
        Ok(value) => ActivityOutcome::Completed(value),
        Err(ActivityError::Cancelled { details }) => {
            debug!(
                activity_id = %context.info().activity_id,
                "activity resolved as cancelled"
            );
            ActivityOutcome::Cancelled(details)
        }
        Err(ActivityError::Application {
            message,
            failure_type,
        }) => ActivityOutcome::Failed(failure_from_message(message, &failure_type)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityHandle, ActivityInfo, ActivityType};
    use crate::heartbeat::heartbeat_channel;

    fn test_context() -> ActivityContext {
        let info = Arc::new(ActivityInfo {
            activity_id: "a1".into(),
            activity_type: ActivityType {
                module: "m".into(),
                function: "f".into(),
            },
            attempt: 1,
            scheduled_time_ms: 0,
            schedule_to_close_timeout: None,
            start_to_close_timeout: None,
            heartbeat_timeout: None,
            heartbeat_details: vec![],
            workflow_namespace: "default".into(),
            workflow_type: "wf".into(),
            workflow_id: "w1".into(),
            workflow_run_id: "r1".into(),
            task_queue: "q".into(),
            namespace: "default".into(),
        });
        let handle = ActivityHandle::new(vec![1, 2], "a1".into());
        let (tx, _rx) = heartbeat_channel();
        ActivityContext::new(info, &handle, tx)
    }

    struct DoublingInterceptor;

    impl ActivityInboundInterceptor for DoublingInterceptor {
        fn execute(
            &self,
            mut input: ActivityExecuteInput,
            next: NextActivityExecutor,
        ) -> BoxFuture<'static, Result<serde_json::Value, ActivityError>> {
            for arg in &mut input.args {
                if let Some(n) = arg.as_i64() {
                    *arg = serde_json::json!(n * 2);
                }
            }
            next.call(input)
        }
    }

    #[tokio::test]
    async fn interceptors_wrap_in_registration_order() {
        let context = test_context();
        let f: ActivityFn = Arc::new(|_ctx, args| {
            Box::pin(async move { Ok(serde_json::json!(args[0].as_i64().unwrap() + 1)) })
        });
        let interceptors: Vec<Arc<dyn ActivityInboundInterceptor>> =
            vec![Arc::new(DoublingInterceptor)];
        let outcome = execute_activity(
            context,
            f,
            &interceptors,
            ActivityExecuteInput {
                args: vec![serde_json::json!(10)],
                headers: HashMap::new(),
            },
        )
        .await;
        match outcome {
            ActivityOutcome::Completed(value) => assert_eq!(value, serde_json::json!(21)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_error_becomes_cancelled_outcome() {
        let context = test_context();
        let f: ActivityFn = Arc::new(|_ctx, _args| {
            Box::pin(async move {
                Err(ActivityError::Cancelled {
                    details: vec![serde_json::json!("cleanup done")],
                })
            })
        });
        let outcome = execute_activity(
            context,
            f,
            &[],
            ActivityExecuteInput {
                args: vec![],
                headers: HashMap::new(),
            },
        )
        .await;
        match outcome {
            ActivityOutcome::Cancelled(details) => {
                assert_eq!(details, vec![serde_json::json!("cleanup done")]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn application_error_becomes_failure() {
        let context = test_context();
        let f: ActivityFn =
            Arc::new(|_ctx, _args| Box::pin(async move { Err(ActivityError::application("nope")) }));
        let outcome = execute_activity(
            context,
            f,
            &[],
            ActivityExecuteInput {
                args: vec![],
                headers: HashMap::new(),
            },
        )
        .await;
        match outcome {
            ActivityOutcome::Failed(failure) => {
                assert_eq!(failure.message, "nope");
                assert_eq!(failure.failure_type, "ApplicationFailure");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
