mod follower;
mod promotion;
mod step_down;
mod support;
