use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use orchflow::{
    ChannelEvent, ChannelOptions, EngineBuilder, Result, WorkflowModel,
    gateway::{AgentRuntime, DispatchRequest},
    hitl::Decision,
    ingress::{CallbackPayload, CallbackStatus},
    runtime::RunStatus,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Agent runtime that hands every dispatch to the main thread.
struct LocalAgents {
    sender: flume::Sender<DispatchRequest>,
}

#[async_trait]
impl AgentRuntime for LocalAgents {
    async fn dispatch(
        &self,
        request: &DispatchRequest,
    ) -> Result<()> {
        self.sender.send_async(request.clone()).await.map_err(|e| orchflow::OrchflowError::Dispatch(e.to_string()))
    }

    async fn abort(
        &self,
        agent_run_id: &str,
    ) -> Result<()> {
        println!("abort requested for {}", agent_run_id);
        Ok(())
    }
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let (sender, receiver) = flume::unbounded();
    let engine = EngineBuilder::new()
        .async_worker_thread_number(4)
        .watchdog_interval(Duration::from_millis(100))
        .agent_runtime(Arc::new(LocalAgents {
            sender,
        }))
        .build()
        .unwrap();

    engine.launch();

    let workflow_model = WorkflowModel::from_json(include_str!("./review.json")).unwrap();
    println!("{}", engine.validate(&workflow_model).unwrap().schema());
    engine.deploy(&workflow_model).unwrap();

    let run_id = engine.start_run(&workflow_model.id, json!({ "topic": "ownership in rust" })).unwrap();

    ChannelEvent::channel(engine.channel(), ChannelOptions::with_run(run_id.clone())).unwrap().on_complete(move |run_id| {
        println!("Run completed: {}", run_id);
    });

    ChannelEvent::channel(engine.channel(), ChannelOptions::with_run(run_id.clone())).unwrap().on_error(move |e| {
        println!("Run error: {:?}", e.event);
    });

    loop {
        // play the agents
        while let Ok(request) = receiver.try_recv() {
            let output = match request.agent_id.as_str() {
                "scorer" => json!({ "score": 0.93 }),
                "writer" => json!({ "text": format!("A {} draft about {}", request.input["tone"].as_str().unwrap_or("plain"), request.input["topic"].as_str().unwrap_or("?")), "confidence": 0.7 }),
                _ => json!({ "text": "outline" }),
            };
            let ack = engine.receive_callback(CallbackPayload {
                run_id: request.run_id.clone(),
                status: CallbackStatus::Completed,
                output,
                error: None,
                secret: request.secret.clone(),
            });
            println!("callback for {} ({}): {:?}", request.node_id, request.agent_id, ack);
        }

        // the draft has low confidence, so a reviewer has to sign it off
        for approval in engine.pending_approvals() {
            println!("approving {} for node {}: {}", approval.id, approval.node_id, approval.output);
            engine.decide(&approval.id, Decision::Approve, "reads well", "demo").unwrap();
        }

        let run = engine.status(&run_id).unwrap();
        if run.status != RunStatus::Running {
            println!("Status: {}", run.status);
            println!("Output: {:#}", run.output.unwrap_or_default());
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    for event in engine.events(&run_id).unwrap() {
        println!("{:>14} {:<10} {}", event.name, event.node_id, event.message);
    }
    engine.shutdown();
}
