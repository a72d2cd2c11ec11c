use image_mirror_operator::crd::ImageMirror;
use kube::CustomResourceExt;

fn main() {
    print!("{}", serde_yaml::to_string(&ImageMirror::crd()).unwrap());
}
