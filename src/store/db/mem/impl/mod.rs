mod approval;
mod event;
mod run;
mod workflow;
